use std::fmt;

use serde::Serialize;
use tracing::{error, info};

use crate::error::{DeviceError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Available,
    Offline,
    Unauthorized,
    Unknown,
}

impl DeviceStatus {
    pub fn from_bridge_state(state: &str) -> Self {
        match state {
            "device" => DeviceStatus::Available,
            "offline" => DeviceStatus::Offline,
            "unauthorized" => DeviceStatus::Unauthorized,
            _ => DeviceStatus::Unknown,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeviceStatus::Available => "available",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unauthorized => "unauthorized",
            DeviceStatus::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// A device as listed by one enumeration; never cached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Device {
    pub serial: String,
    pub status: DeviceStatus,
}

impl Device {
    pub fn is_available(&self) -> bool {
        self.status == DeviceStatus::Available
    }
}

/// Parses the `host:devices` block. Lines that are not exactly
/// `<serial>\t<state>` are dropped.
pub fn parse_devices(output: &str) -> Vec<Device> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split('\t').collect();
            match parts.as_slice() {
                [serial, state] if !serial.is_empty() => Some(Device {
                    serial: serial.to_string(),
                    status: DeviceStatus::from_bridge_state(state),
                }),
                _ => None,
            }
        })
        .collect()
}

pub fn log_devices(devices: &[Device]) {
    info!("Here are the available devices, copy one to the serial setting or use \"auto\"");
    let (available, unavailable): (Vec<&Device>, Vec<&Device>) =
        devices.iter().partition(|d| d.is_available());
    for device in &available {
        info!("{}", device.serial);
    }
    if available.is_empty() {
        info!("No available devices");
    }
    if !unavailable.is_empty() {
        info!("Here are the devices detected but unavailable");
        for device in &unavailable {
            info!("{} ({})", device.serial, device.status);
        }
    }
}

/// Picks the single listed device; zero or several need an operator.
///
/// Availability does not filter the count.
pub fn resolve_auto_device(devices: &[Device]) -> Result<&Device> {
    match devices {
        [] => {
            error!(
                takeover = true,
                "No available device found, auto device detection cannot work, \
                 set an exact serial instead of \"auto\""
            );
            Err(DeviceError::takeover("no device found"))
        }
        [device] => {
            info!("Auto device detection found only one device, using it");
            Ok(device)
        }
        _ => {
            let candidates = join_candidates(devices.iter().map(|d| d.serial.as_str()));
            error!(
                takeover = true,
                "Multiple devices found, auto device detection cannot decide which to choose: {candidates}"
            );
            Err(DeviceError::takeover(format!(
                "multiple devices found: {candidates}"
            )))
        }
    }
}

/// `dumpsys package` lines look like `  Package [com.example] (1a2b3c):`.
pub fn parse_dumpsys_packages(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.split_once("Package [")?.1;
            let (name, _) = rest.split_once(']')?;
            if name.is_empty() || name.contains(char::is_whitespace) {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

/// `pm list packages` lines look like `package:com.example`.
pub fn parse_pm_packages(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let name = line.trim().strip_prefix("package:")?;
            let name = name.split_whitespace().next()?;
            Some(name.to_string())
        })
        .collect()
}

pub fn filter_packages(packages: &[String], keywords: &[String]) -> Vec<String> {
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    packages
        .iter()
        .filter(|package| {
            let lower = package.to_lowercase();
            keywords.iter().any(|k| lower.contains(k.as_str()))
        })
        .cloned()
        .collect()
}

/// Picks the single package matching `keywords`.
pub fn resolve_auto_package(serial: &str, packages: &[String], keywords: &[String]) -> Result<String> {
    let matches = filter_packages(packages, keywords);
    let label = keywords.first().map(String::as_str).unwrap_or("target");

    info!("Here are the available packages on device \"{serial}\"");
    if matches.is_empty() {
        info!("No available packages on device \"{serial}\"");
    }
    for package in &matches {
        info!("{package}");
    }

    match matches.as_slice() {
        [] => {
            error!(
                takeover = true,
                "No {label} package found, confirm it is installed on device \"{serial}\""
            );
            Err(DeviceError::takeover(format!("no {label} package found")))
        }
        [package] => {
            info!("Auto package detection found only one package, using it");
            Ok(package.clone())
        }
        _ => {
            let candidates = join_candidates(matches.iter().map(String::as_str));
            error!(
                takeover = true,
                "Multiple {label} packages found, auto package detection cannot decide which to choose: {candidates}"
            );
            Err(DeviceError::takeover(format!(
                "multiple packages found: {candidates}"
            )))
        }
    }
}

fn join_candidates<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(", ")
}
