use std::{
    fs, io,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DeviceError, Result};

const CONFIG_FILE_NAME: &str = "device-config.json";

pub const AUTO: &str = "auto";

/// Connection settings owned by the caller's config store.
///
/// Serial, package and the method fields may be overwritten when
/// auto-resolution or an alias settles on a concrete value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub serial: String,
    pub package_name: String,
    pub package_keywords: Vec<String>,
    pub bridge_addr: String,
    pub adb_binary: Option<PathBuf>,
    pub forward_port_range: (u16, u16),
    pub reverse_server_port: u16,
    pub screenshot_method: String,
    pub control_method: String,
    pub retry_tries: u32,
    pub retry_delay_ms: u64,
    pub shell_timeout_ms: u64,
    pub accept_timeout_ms: u64,
    pub bluestacks_conf_dir: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: AUTO.into(),
            package_name: AUTO.into(),
            package_keywords: vec!["azurlane".into(), "blhx".into()],
            bridge_addr: adbkeep_util::DEFAULT_BRIDGE_ADDR.into(),
            adb_binary: None,
            forward_port_range: (20000, 21000),
            reverse_server_port: 7903,
            screenshot_method: "adb".into(),
            control_method: "adb".into(),
            retry_tries: 5,
            retry_delay_ms: 3000,
            shell_timeout_ms: 10_000,
            accept_timeout_ms: 5_000,
            bluestacks_conf_dir: None,
        }
    }
}

impl DeviceConfig {
    pub fn default_path() -> PathBuf {
        adbkeep_util::state_file_path(CONFIG_FILE_NAME)
    }

    /// Reads `path`, falling back to defaults when it is missing, then
    /// applies `ADBKEEP_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = match fs::read_to_string(path) {
            Ok(data) => serde_json::from_str::<DeviceConfig>(&data).map_err(|err| {
                DeviceError::Config(format!("failed to parse {}: {err}", path.display()))
            })?,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {}", path.display(), err);
                }
                DeviceConfig::default()
            }
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        adbkeep_util::write_json_atomic(path, self)
    }

    fn apply_env(&mut self) {
        if let Ok(serial) = std::env::var("ADBKEEP_SERIAL") {
            self.serial = serial;
        }
        if let Ok(package) = std::env::var("ADBKEEP_PACKAGE") {
            self.package_name = package;
        }
        if let Ok(addr) = std::env::var("ADBKEEP_BRIDGE_ADDR") {
            self.bridge_addr = addr;
        }
        if let Ok(path) = std::env::var("ADBKEEP_ADB_PATH") {
            self.adb_binary = Some(adbkeep_util::expand_user(&path));
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (low, high) = self.forward_port_range;
        if low == 0 || low > high {
            return Err(DeviceError::Config(format!(
                "forward_port_range ({low}, {high}) is empty"
            )));
        }
        if self.reverse_server_port == 0 {
            return Err(DeviceError::Config("reverse_server_port must be set".into()));
        }
        if self.retry_tries == 0 {
            return Err(DeviceError::Config("retry_tries must be at least 1".into()));
        }
        Ok(())
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.forward_port_range.0..=self.forward_port_range.1
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_millis(self.shell_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DeviceConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.package_name, AUTO);
        assert_eq!(cfg.port_range(), 20000..=21000);
        assert_eq!(cfg.accept_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"package_name": "com.bilibili.azurlane", "retry_tries": 3}"#).unwrap();
        let cfg = DeviceConfig::load(&path).unwrap();
        assert_eq!(cfg.package_name, "com.bilibili.azurlane");
        assert_eq!(cfg.retry_tries, 3);
        assert_eq!(cfg.reverse_server_port, 7903);
    }

    #[test]
    fn save_then_load_preserves_resolved_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("cfg.json");
        let cfg = DeviceConfig {
            package_name: "com.YoStarEN.AzurLane".into(),
            ..DeviceConfig::default()
        };
        cfg.save(&path).unwrap();
        let loaded = DeviceConfig::load(&path).unwrap();
        assert_eq!(loaded.package_name, cfg.package_name);
    }

    #[test]
    fn env_overrides_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"bridge_addr": "127.0.0.1:5038"}"#).unwrap();

        std::env::set_var("ADBKEEP_BRIDGE_ADDR", "127.0.0.1:15037");
        let cfg = DeviceConfig::load(&path);
        std::env::remove_var("ADBKEEP_BRIDGE_ADDR");

        assert_eq!(cfg.unwrap().bridge_addr, "127.0.0.1:15037");
    }

    #[test]
    fn rejects_empty_port_range() {
        let cfg = DeviceConfig {
            forward_port_range: (21000, 20000),
            ..DeviceConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(DeviceError::Config(_))));
    }
}
