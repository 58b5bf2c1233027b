use std::{fs, path::PathBuf};

use tracing::{info, warn};

use crate::error::{DeviceError, Result};

/// BlueStacks Hyper-V editions publish a different bridge port on every boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HypervisorEdition {
    Bluestacks4,
    Bluestacks5,
}

impl HypervisorEdition {
    fn token(self) -> &'static str {
        match self {
            HypervisorEdition::Bluestacks4 => "bluestacks4-hyperv",
            HypervisorEdition::Bluestacks5 => "bluestacks5-hyperv",
        }
    }
}

/// `bluestacks5-hyperv` or `bluestacks5-hyperv-2` for a second instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HypervisorAlias {
    pub edition: HypervisorEdition,
    pub instance: Option<u32>,
}

impl HypervisorAlias {
    pub fn parse(serial: &str) -> Option<Self> {
        for edition in [HypervisorEdition::Bluestacks4, HypervisorEdition::Bluestacks5] {
            let Some(start) = serial.find(edition.token()) else {
                continue;
            };
            let rest = &serial[start + edition.token().len()..];
            let instance = match rest.strip_prefix('-') {
                None if rest.is_empty() => None,
                Some(suffix) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
                    Some(suffix.parse::<u32>().ok()?)
                }
                // Anything else is not an alias this lookup understands.
                _ => return None,
            };
            return Some(Self { edition, instance });
        }
        None
    }
}

/// Reads a hypervisor's own configuration to find an alias's bridge port.
pub trait HostConfigLookup: Send + Sync {
    /// `Ok(None)` when the store has no entry for the alias.
    fn bridge_port(&self, alias: &HypervisorAlias) -> Result<Option<u16>>;
}

/// Used where no hypervisor store is readable; every alias stays unresolved.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLookup;

impl HostConfigLookup for NoLookup {
    fn bridge_port(&self, _alias: &HypervisorAlias) -> Result<Option<u16>> {
        Ok(None)
    }
}

/// Parses `bluestacks.conf` from BlueStacks 5's user data directory.
///
/// BlueStacks 4 keeps its port only in the Windows registry, so its
/// aliases are never resolved here.
#[derive(Clone, Debug)]
pub struct BluestacksConf {
    dir: PathBuf,
}

impl BluestacksConf {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn parameter_name(instance: Option<u32>) -> String {
        match instance {
            None => "bst.instance.Nougat64.status.adb_port".to_string(),
            Some(n) => format!("bst.instance.Nougat64_{n}.status.adb_port"),
        }
    }
}

impl HostConfigLookup for BluestacksConf {
    fn bridge_port(&self, alias: &HypervisorAlias) -> Result<Option<u16>> {
        if alias.edition != HypervisorEdition::Bluestacks5 {
            return Ok(None);
        }
        let path = self.dir.join("bluestacks.conf");
        info!("Reading realtime adb port from {}", path.display());
        let content = fs::read_to_string(&path)?;
        let key = Self::parameter_name(alias.instance);

        for line in content.lines() {
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            if name.trim() != key {
                continue;
            }
            let value = value.trim().trim_matches('"');
            return value.parse::<u16>().map(Some).map_err(|_| {
                DeviceError::Config(format!("{key} has non-numeric value {value:?}"))
            });
        }
        warn!("Did not find {key} in {}", path.display());
        Ok(None)
    }
}
