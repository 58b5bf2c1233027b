use async_trait::async_trait;

use crate::error::Result;
use crate::tunnel::{Direction, Tunnel};

/// The debug-bridge daemon as seen by one controller.
///
/// [`crate::host::AdbHost`] speaks the real smart-socket protocol; tests
/// substitute an in-memory bridge.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Raw `host:devices` block, one `<serial>\t<state>` per line.
    async fn devices(&self) -> Result<String>;

    /// Response text of `host:connect:`, e.g. `connected to 127.0.0.1:5555`.
    async fn connect(&self, serial: &str) -> Result<String>;

    async fn disconnect(&self, serial: &str) -> Result<String>;

    async fn shell(&self, serial: &str, command: &str) -> Result<String>;

    /// Starts a shell command and returns once the device accepted it; its
    /// output is drained in the background until the command exits.
    async fn shell_detached(&self, serial: &str, command: &str) -> Result<()>;

    async fn list_tunnels(&self, serial: &str, direction: Direction) -> Result<Vec<Tunnel>>;

    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<()>;

    /// `host-serial:<serial>:killforward:<local>`
    async fn remove_forward(&self, serial: &str, local: &str) -> Result<()>;

    /// `host:transport:<serial>` then `reverse:killforward:<remote>`
    async fn remove_reverse(&self, serial: &str, remote: &str) -> Result<()>;
}
