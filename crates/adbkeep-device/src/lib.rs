//! Resilient control channel to an Android device through the debug bridge.
//!
//! [`Connection`] owns one device: it resolves the serial, connects, finds
//! the target package, and keeps forward/reverse tunnels and the reverse
//! data channel alive. Every public operation runs under the retry
//! executor, which reconnects or re-detects the package between attempts
//! and escalates to [`DeviceError::HumanTakeover`] once it gives up.

mod adb;
mod alias;
mod bridge;
mod config;
mod connection;
mod discovery;
mod error;
mod host;
mod ids;
mod orientation;
mod retry;
mod reverse;
mod server;
mod tunnel;

#[cfg(test)]
mod testing;

pub use adb::AdbBinary;
pub use alias::{BluestacksConf, HostConfigLookup, HypervisorAlias, HypervisorEdition, NoLookup};
pub use bridge::Bridge;
pub use config::{DeviceConfig, AUTO};
pub use connection::{Connection, ConnectionState};
pub use discovery::{Device, DeviceStatus};
pub use error::{DeviceError, FailureKind, Result};
pub use host::AdbHost;
pub use orientation::Orientation;
pub use retry::{execute, Recover, Recovery, RetryPolicy};
pub use reverse::ReverseChannel;
pub use server::Server;
pub use tunnel::{Direction, PortTunnels, Tunnel};
