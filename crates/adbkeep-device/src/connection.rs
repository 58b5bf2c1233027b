use std::{io, path::Path, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::adb::AdbBinary;
use crate::alias::{BluestacksConf, HostConfigLookup, HypervisorAlias, NoLookup};
use crate::bridge::Bridge;
use crate::config::{DeviceConfig, AUTO};
use crate::discovery::{
    log_devices, parse_devices, parse_dumpsys_packages, parse_pm_packages, resolve_auto_device,
    resolve_auto_package, Device,
};
use crate::error::{DeviceError, Result};
use crate::host::AdbHost;
use crate::ids::{canonicalize_serial, is_embedded_emulator};
use crate::orientation::{parse_orientation, Orientation};
use crate::retry::{execute, Recover, RetryPolicy};
use crate::reverse::ReverseChannel;
use crate::server::Server;
use crate::tunnel::PortTunnels;

const CONNECT_ATTEMPTS: usize = 3;
const REVERSE_BIND_ATTEMPTS: usize = 3;
/// Fixed address of Windows Subsystem for Android. Other emulators use the
/// same port by default, so a literal serial is refused.
const WSA_ADDR: &str = "127.0.0.1:58526";
const WSA_METHOD: &str = "uiautomator2";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub serial: String,
    pub connected: bool,
    pub package: Option<String>,
    pub server: Option<Server>,
    pub orientation: Orientation,
}

impl ConnectionState {
    fn for_serial(serial: String) -> Self {
        Self {
            serial,
            ..Self::default()
        }
    }
}

/// Control channel to one device.
///
/// Owns the connection state, the tunnel allocations and the reverse
/// data channel for the current serial. Operations run strictly in
/// issue order; use one instance per device.
pub struct Connection {
    bridge: Arc<dyn Bridge>,
    binary: AdbBinary,
    lookup: Box<dyn HostConfigLookup>,
    config: DeviceConfig,
    config_dirty: bool,
    policy: RetryPolicy,
    state: ConnectionState,
    tunnels: PortTunnels,
    reverse_channel: Option<ReverseChannel>,
}

impl Connection {
    pub fn new(
        bridge: Arc<dyn Bridge>,
        binary: AdbBinary,
        lookup: Box<dyn HostConfigLookup>,
        config: DeviceConfig,
    ) -> Self {
        let policy = RetryPolicy {
            tries: config.retry_tries,
            delay: config.retry_delay(),
        };
        let tunnels = PortTunnels::new(config.port_range());
        let state = ConnectionState::for_serial(config.serial.clone());
        Self {
            bridge,
            binary,
            lookup,
            config,
            config_dirty: false,
            policy,
            state,
            tunnels,
            reverse_channel: None,
        }
    }

    /// Wires the real bridge client, binary and alias lookup from `config`.
    pub fn from_config(config: DeviceConfig) -> Self {
        let bridge = Arc::new(AdbHost::new(
            config.bridge_addr.clone(),
            config.shell_timeout(),
        ));
        let binary = AdbBinary::resolve(config.adb_binary.as_deref());
        let lookup: Box<dyn HostConfigLookup> = match config.bluestacks_conf_dir.as_ref() {
            Some(dir) => Box::new(BluestacksConf::new(dir)),
            None => Box::new(NoLookup),
        };
        info!("AdbBinary: {}", binary.path().display());
        Self::new(bridge, binary, lookup, config)
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn serial(&self) -> &str {
        &self.state.serial
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Serial, package or method fields were rewritten since the last save.
    pub fn config_dirty(&self) -> bool {
        self.config_dirty
    }

    pub fn save_config(&mut self, path: &Path) -> io::Result<()> {
        self.config.save(path)?;
        self.config_dirty = false;
        Ok(())
    }

    /// Resolves the configured serial, binds a device, connects, and
    /// settles the package.
    pub async fn open(&mut self) -> Result<()> {
        let raw = self.config.serial.clone();
        let serial = self.resolve_serial(&raw)?;
        self.set_serial(serial);
        self.detect_device().await?;

        let serial = self.state.serial.clone();
        self.connect(&serial).await?;
        info!("AdbDevice: {serial}");

        if self.config.package_name == AUTO {
            self.detect_package(false).await?;
        } else {
            let package = self.config.package_name.clone();
            self.apply_package(package, false);
        }
        info!(
            "PackageName: {}",
            self.state.package.as_deref().unwrap_or("<none>")
        );
        Ok(())
    }

    /// Turns a configured serial into something the bridge can connect to.
    ///
    /// Hypervisor aliases go through the host-config lookup and stay as
    /// they are when it fails. The WSA alias rewrites the method fields.
    pub fn resolve_serial(&mut self, raw: &str) -> Result<String> {
        let mut serial = raw.trim().to_string();

        if let Some(alias) = HypervisorAlias::parse(&serial) {
            info!("Use {:?} Hyper-V alias {serial}", alias.edition);
            serial = match self.lookup.bridge_port(&alias) {
                Ok(Some(port)) => {
                    info!("New adb port: {port}");
                    format!("127.0.0.1:{port}")
                }
                Ok(None) => {
                    warn!("No adb port recorded for {serial}, using it as is");
                    serial
                }
                Err(err) => {
                    warn!("Failed to look up adb port for {serial}: {err}");
                    serial
                }
            };
        }

        if canonicalize_serial(&serial) == WSA_ADDR {
            error!(
                takeover = true,
                "Serial {WSA_ADDR} seems to be WSA, use \"wsa-0\" or others instead"
            );
            return Err(DeviceError::takeover(format!(
                "serial {WSA_ADDR} collides with other emulators"
            )));
        }

        if serial.contains("wsa") {
            if self.config.screenshot_method != WSA_METHOD || self.config.control_method != WSA_METHOD
            {
                self.config.screenshot_method = WSA_METHOD.into();
                self.config.control_method = WSA_METHOD.into();
                self.config_dirty = true;
            }
            return Ok(WSA_ADDR.to_string());
        }

        Ok(serial)
    }

    /// Switches to `serial`, dropping everything tied to the old one.
    fn set_serial(&mut self, serial: String) {
        if serial == self.state.serial {
            return;
        }
        let previous = std::mem::replace(
            &mut self.state,
            ConnectionState::for_serial(serial),
        );
        self.state.package = previous.package;
        self.state.server = previous.server;
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.tunnels.invalidate();
        self.reverse_channel = None;
    }

    /// Returns `Ok(false)` when no attempt gave a clear answer; the device
    /// may still be usable.
    pub async fn connect(&mut self, serial: &str) -> Result<bool> {
        if is_embedded_emulator(serial) {
            self.state.connected = true;
            return Ok(true);
        }

        for _ in 0..CONNECT_ATTEMPTS {
            let msg = self.bridge.connect(serial).await?;
            info!("{msg}");
            if msg.contains("connected") {
                self.state.connected = true;
                return Ok(true);
            }
            if msg.contains("bad port") {
                error!(takeover = true, "{msg}: serial incorrect, might be a typo");
                return Err(DeviceError::takeover(msg));
            }
        }

        warn!("Failed to connect {serial} after {CONNECT_ATTEMPTS} trials, assume connected");
        self.detect_device().await?;
        Ok(false)
    }

    /// Never fails; the bridge's answer is only logged.
    pub async fn disconnect(&mut self, serial: &str) {
        match self.bridge.disconnect(serial).await {
            Ok(msg) if !msg.trim().is_empty() => info!("{}", msg.trim()),
            Ok(_) => {}
            Err(err) => debug!("disconnect {serial}: {err}"),
        }
        self.state.connected = false;
        self.invalidate();
    }

    pub async fn enumerate_devices(&mut self) -> Result<Vec<Device>> {
        let policy = self.policy.clone();
        execute(self, &policy, "iter_device", |c| {
            Box::pin(async move {
                let output = c.bridge.devices().await?;
                Ok(parse_devices(&output))
            })
        })
        .await
    }

    /// Lists devices and binds one when the configured serial is `auto`.
    pub async fn detect_device(&mut self) -> Result<Vec<Device>> {
        info!("Detect device");
        let devices = self.enumerate_devices().await?;
        log_devices(&devices);

        if self.config.serial == AUTO {
            let serial = resolve_auto_device(&devices)?.serial.clone();
            self.set_serial(serial);
        }
        Ok(devices)
    }

    /// Installed packages, trying the fast `dumpsys` listing first.
    pub async fn list_packages(&mut self) -> Result<Vec<String>> {
        let policy = self.policy.clone();
        execute(self, &policy, "list_package", |c| {
            Box::pin(async move {
                info!("Get package list");
                let output = c.shell_once(r#"dumpsys package | grep "Package \[""#).await?;
                let packages = parse_dumpsys_packages(&output);
                if !packages.is_empty() {
                    return Ok(packages);
                }

                info!("Get package list with pm");
                let output = c.shell_once("pm list packages").await?;
                Ok(parse_pm_packages(&output))
            })
        })
        .await
    }

    /// Binds the single package matching the configured keywords. With
    /// `persist`, the choice is written back to the config.
    pub async fn detect_package(&mut self, persist: bool) -> Result<String> {
        info!("Detect package");
        let packages = self.list_packages().await?;
        let package = resolve_auto_package(
            &self.state.serial,
            &packages,
            &self.config.package_keywords,
        )?;
        self.apply_package(package.clone(), persist);
        Ok(package)
    }

    fn apply_package(&mut self, package: String, persist: bool) {
        if persist && self.config.package_name != package {
            self.config.package_name = package.clone();
            self.config_dirty = true;
        }
        self.state.server = Server::from_package(&package);
        match self.state.server {
            Some(server) => info!("Server: {server} ({})", server.lang()),
            None => warn!("Package {package} does not belong to a known server"),
        }
        self.state.package = Some(package);
    }

    async fn shell_once(&self, command: &str) -> Result<String> {
        self.bridge.shell(&self.state.serial, command).await
    }

    /// `adb shell <command>` with retries.
    pub async fn shell(&mut self, command: &str) -> Result<String> {
        let policy = self.policy.clone();
        let command = command.to_string();
        execute(self, &policy, "adb_shell", move |c| {
            let command = command.clone();
            Box::pin(async move { c.shell_once(&command).await })
        })
        .await
    }

    /// Rotation from `dumpsys display`. Only the transport is retried;
    /// unparsable output is `Normal`.
    pub async fn orientation(&mut self) -> Result<Orientation> {
        let policy = self.policy.clone();
        let output = execute(self, &policy, "get_orientation", |c| {
            Box::pin(async move { c.shell_once("dumpsys display").await })
        })
        .await?;
        let orientation = parse_orientation(&output);
        self.state.orientation = orientation;
        info!("Device Orientation: {orientation}");
        Ok(orientation)
    }

    /// Starts the resolved package through its launcher intent.
    pub async fn launch_package(&mut self) -> Result<()> {
        let policy = self.policy.clone();
        execute(self, &policy, "app_start", |c| {
            Box::pin(async move {
                let package = c.state.package.clone().ok_or_else(|| {
                    DeviceError::PackageNotInstalled("no package resolved".into())
                })?;
                let output = c
                    .shell_once(&format!(
                        "monkey -p {package} -c android.intent.category.LAUNCHER 1"
                    ))
                    .await?;
                if output.contains("No activities found") {
                    return Err(DeviceError::PackageNotInstalled(package));
                }
                Ok(())
            })
        })
        .await
    }

    pub async fn forward(&mut self, remote: &str) -> Result<u16> {
        let policy = self.policy.clone();
        let remote = remote.to_string();
        execute(self, &policy, "adb_forward", move |c| {
            let remote = remote.clone();
            Box::pin(async move {
                c.tunnels
                    .forward(c.bridge.as_ref(), &c.state.serial, &remote)
                    .await
            })
        })
        .await
    }

    pub async fn reverse(&mut self, remote: &str) -> Result<u16> {
        let policy = self.policy.clone();
        let remote = remote.to_string();
        execute(self, &policy, "adb_reverse", move |c| {
            let remote = remote.clone();
            Box::pin(async move {
                c.tunnels
                    .reverse(c.bridge.as_ref(), &c.state.serial, &remote)
                    .await
            })
        })
        .await
    }

    pub async fn remove_forward(&mut self, local_port: u16) -> Result<()> {
        self.tunnels
            .remove_forward(self.bridge.as_ref(), &self.state.serial, local_port)
            .await
    }

    /// Removes the reverse tunnel published at the device-side `remote` spec.
    pub async fn remove_reverse(&mut self, remote: &str) -> Result<()> {
        self.tunnels
            .remove_reverse(self.bridge.as_ref(), &self.state.serial, remote)
            .await?;
        let ours = self
            .reverse_channel
            .as_ref()
            .is_some_and(|ch| format!("tcp:{}", ch.remote_port()) == remote);
        if ours {
            self.reverse_channel = None;
        }
        Ok(())
    }

    /// Binds the reverse listener once and publishes it on the device.
    ///
    /// A host port that turns out to be taken is unpublished and another
    /// candidate is tried. Running out of candidates here is left to the
    /// caller's retry budget.
    async fn ensure_reverse_channel(&mut self) -> Result<()> {
        if self.reverse_channel.is_some() {
            return Ok(());
        }
        let remote_port = self.config.reverse_server_port;
        let remote = format!("tcp:{remote_port}");

        for _ in 0..REVERSE_BIND_ATTEMPTS {
            let port = self.reverse(&remote).await?;
            match ReverseChannel::bind(port, remote_port).await {
                Ok(channel) => {
                    self.reverse_channel = Some(channel);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    warn!("Reverse port {port} is taken, re-allocating: {err}");
                    self.remove_reverse(&remote).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(DeviceError::Io(io::Error::new(
            io::ErrorKind::AddrInUse,
            "could not bind a reverse server port",
        )))
    }

    /// Runs `command` on the device and collects its stdout through the
    /// reverse channel. Binding the channel is retried; an accept timeout
    /// is returned as is.
    pub async fn fast_pull(&mut self, command: &str) -> Result<Vec<u8>> {
        let policy = self.policy.clone();
        execute(self, &policy, "reverse_server", |c| {
            Box::pin(c.ensure_reverse_channel())
        })
        .await?;
        let Some(channel) = self.reverse_channel.as_ref() else {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "reverse server is not bound",
            )));
        };
        channel.discard_stale();
        let relay = channel.relay_command(command);
        self.bridge
            .shell_detached(&self.state.serial, &relay)
            .await?;
        channel.receive(self.config.accept_timeout()).await
    }

    /// `adb -s <serial> <args...>` through the configured binary.
    pub async fn adb_command(&self, args: &[&str]) -> Result<Vec<u8>> {
        self.binary
            .run(&self.state.serial, args, self.config.shell_timeout())
            .await
    }

    pub async fn push(&self, local: &str, remote: &str) -> Result<String> {
        let output = self.adb_command(&["push", local, remote]).await?;
        Ok(String::from_utf8_lossy(&output).trim().to_string())
    }
}

#[async_trait]
impl Recover for Connection {
    async fn reconnect(&mut self) -> Result<()> {
        let serial = self.state.serial.clone();
        self.disconnect(&serial).await;
        self.connect(&serial).await.map(|_| ())
    }

    async fn redetect_package(&mut self) -> Result<()> {
        self.detect_package(true).await.map(|_| ())
    }
}
