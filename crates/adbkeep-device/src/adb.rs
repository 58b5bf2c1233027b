use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::process::Command;
use tracing::debug;

use crate::error::{DeviceError, Result};

/// Location of the `adb` executable used for subprocess transfers.
///
/// The path is resolved once from configuration and handed to the
/// connection; nothing global is patched.
#[derive(Clone, Debug)]
pub struct AdbBinary {
    path: PathBuf,
}

impl AdbBinary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Explicit path first, then `ADBKEEP_ADB_PATH`, then the SDK's
    /// platform-tools, then whatever `adb` is on PATH.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }
        if let Ok(path) = std::env::var("ADBKEEP_ADB_PATH") {
            return Self::new(adbkeep_util::expand_user(&path));
        }
        if let Ok(sdk_root) =
            std::env::var("ANDROID_SDK_ROOT").or_else(|_| std::env::var("ANDROID_HOME"))
        {
            let tools = PathBuf::from(&sdk_root).join("platform-tools");
            for name in ["adb", "adb.exe"] {
                let candidate = tools.join(name);
                if candidate.exists() {
                    return Self::new(candidate);
                }
            }
        }
        Self::new("adb")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `adb -s <serial> <args...>` and returns stdout.
    pub async fn run(&self, serial: &str, args: &[&str], timeout: Duration) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-s")
            .arg(serial)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("{} -s {serial} {}", self.path.display(), args.join(" "));

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    DeviceError::AdbNotFound
                } else {
                    DeviceError::Io(e)
                }
            })?,
            Err(_) => {
                return Err(DeviceError::Timeout(format!(
                    "adb {} exceeded {timeout:?}",
                    args.join(" ")
                )))
            }
        };

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DeviceError::Exit {
                status: output.status.code().unwrap_or(-1),
                detail: format_adb_output(&stdout, &stderr).trim().to_string(),
            })
        }
    }
}

pub(crate) fn format_adb_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    let mut out = String::new();

    if !stdout.is_empty() {
        out.push_str("stdout:\n");
        out.push_str(stdout);
        out.push('\n');
    }
    if !stderr.is_empty() {
        out.push_str("stderr:\n");
        out.push_str(stderr);
        out.push('\n');
    }

    out
}
