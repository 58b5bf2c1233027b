use std::{
    io::Write,
    path::PathBuf,
    process::ExitCode,
};

use adbkeep_device::{Connection, DeviceConfig, DeviceError, AUTO};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "adbkeep", version, about = "Resilient adb control channel")]
struct Cli {
    /// Config file (defaults to the adbkeep state directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the configured serial for this run
    #[arg(long, global = true)]
    serial: Option<String>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List devices known to the bridge
    Devices,
    /// Show what a configured serial resolves to
    ResolveSerial { raw: String },
    /// Connect, detect the package and print the connection state
    Connect,
    /// Disconnect the configured serial
    Disconnect,
    /// Run a shell command on the device
    Shell { command: String },
    /// List installed packages
    Packages,
    /// Detect the target package and store it in the config
    DetectPackage,
    /// Start the target package
    Launch,
    /// Forward a free host port to a device-side spec
    Forward { remote: String },
    /// Publish a host port on the device at `remote`
    Reverse { remote: String },
    /// Remove a forward by its host port
    RemoveForward { port: u16 },
    /// Remove a reverse by its device-side spec
    RemoveReverse { remote: String },
    /// Read the display rotation
    Orientation,
    /// Run a command and collect its stdout through the reverse channel
    FastPull {
        command: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Push a file with the adb binary
    Push { local: String, remote: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = adbkeep_util::init_tracing() {
        eprintln!("failed to initialise logging: {err}");
    }
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            if err.is_fatal() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<(), DeviceError> {
    let config_path = cli.config.clone().unwrap_or_else(DeviceConfig::default_path);
    let mut config = DeviceConfig::load(&config_path)?;
    if let Some(serial) = cli.serial.clone() {
        config.serial = serial;
    }
    let mut conn = Connection::from_config(config);
    let json = cli.json;

    let result = dispatch(&mut conn, cli.cmd, json).await;

    // Persist settled values even when the command itself failed.
    if conn.config_dirty() && cli.serial.is_none() {
        match conn.save_config(&config_path) {
            Ok(()) => info!("Saved config to {}", config_path.display()),
            Err(err) => error!("Failed to save {}: {err}", config_path.display()),
        }
    }
    result
}

async fn dispatch(conn: &mut Connection, cmd: Cmd, json: bool) -> Result<(), DeviceError> {
    match cmd {
        Cmd::Devices => {
            let devices = conn.enumerate_devices().await?;
            if json {
                print_json(&devices)?;
            } else {
                for device in devices {
                    println!("{}\t{}", device.serial, device.status);
                }
            }
        }
        Cmd::ResolveSerial { raw } => {
            let serial = conn.resolve_serial(&raw)?;
            emit(json, &serial, &serial)?;
        }
        Cmd::Connect => {
            conn.open().await?;
            let state = conn.state();
            if json {
                print_json(state)?;
            } else {
                println!("serial\t{}", state.serial);
                println!("connected\t{}", state.connected);
                println!("package\t{}", state.package.as_deref().unwrap_or("-"));
                println!(
                    "server\t{}",
                    state.server.map(|s| s.to_string()).unwrap_or_else(|| "-".into())
                );
            }
        }
        Cmd::Disconnect => {
            let raw = conn.config().serial.clone();
            let mut serial = conn.resolve_serial(&raw)?;
            if serial == AUTO {
                conn.detect_device().await?;
                serial = conn.serial().to_string();
            }
            conn.disconnect(&serial).await;
        }
        Cmd::Shell { command } => {
            conn.open().await?;
            let output = conn.shell(&command).await?;
            emit(json, &output, output.trim_end())?;
        }
        Cmd::Packages => {
            conn.open().await?;
            let packages = conn.list_packages().await?;
            if json {
                print_json(&packages)?;
            } else {
                for package in packages {
                    println!("{package}");
                }
            }
        }
        Cmd::DetectPackage => {
            conn.open().await?;
            let package = conn.detect_package(true).await?;
            emit(json, &package, &package)?;
        }
        Cmd::Launch => {
            conn.open().await?;
            conn.launch_package().await?;
        }
        Cmd::Forward { remote } => {
            conn.open().await?;
            let port = conn.forward(&remote).await?;
            emit(json, &port, &format!("tcp:{port}\t{remote}"))?;
        }
        Cmd::Reverse { remote } => {
            conn.open().await?;
            let port = conn.reverse(&remote).await?;
            emit(json, &port, &format!("{remote}\ttcp:{port}"))?;
        }
        Cmd::RemoveForward { port } => {
            conn.open().await?;
            conn.remove_forward(port).await?;
        }
        Cmd::RemoveReverse { remote } => {
            conn.open().await?;
            conn.remove_reverse(&remote).await?;
        }
        Cmd::Orientation => {
            conn.open().await?;
            let orientation = conn.orientation().await?;
            emit(json, &orientation.value(), &orientation.to_string())?;
        }
        Cmd::FastPull { command, out } => {
            conn.open().await?;
            let data = conn.fast_pull(&command).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &data)?;
                    info!("Wrote {} bytes to {}", data.len(), path.display());
                }
                None => std::io::stdout().write_all(&data)?,
            }
        }
        Cmd::Push { local, remote } => {
            conn.open().await?;
            let output = conn.push(&local, &remote).await?;
            emit(json, &output, &output)?;
        }
    }
    Ok(())
}

fn emit<T: Serialize + ?Sized>(json: bool, value: &T, text: &str) -> Result<(), DeviceError> {
    if json {
        print_json(value)
    } else {
        println!("{text}");
        Ok(())
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), DeviceError> {
    let text = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    println!("{text}");
    Ok(())
}
