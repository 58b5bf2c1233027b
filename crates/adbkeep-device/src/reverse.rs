use std::{io, time::Duration};

use futures_util::FutureExt;
use tokio::{io::AsyncReadExt, net::TcpListener};
use tracing::{debug, info, warn};

use crate::error::{DeviceError, Result};

const CHUNK_SIZE: usize = 256 * 1024;

/// Local listener the device dials back to through a reverse tunnel.
///
/// Device output is piped through `nc` into this listener instead of
/// being read line by line over the shell protocol. The listener lives
/// as long as the channel; each [`ReverseChannel::receive`] consumes
/// exactly one inbound connection. Calls must not overlap.
pub struct ReverseChannel {
    listener: TcpListener,
    local_port: u16,
    remote_port: u16,
}

impl ReverseChannel {
    pub async fn bind(local_port: u16, remote_port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", local_port)).await?;
        let local_port = listener.local_addr()?.port();
        info!("Reverse server listening on {local_port}");
        Ok(Self {
            listener,
            local_port,
            remote_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// `<command> | nc 127.0.0.1 <remote_port>`
    pub fn relay_command(&self, command: &str) -> String {
        format!("{command} | nc 127.0.0.1 {}", self.remote_port)
    }

    /// Drops connections already waiting in the backlog, such as a relay
    /// that dialed back after an earlier accept timed out.
    pub fn discard_stale(&self) {
        while let Some(accepted) = self.listener.accept().now_or_never() {
            match accepted {
                Ok((_, peer)) => warn!("Dropped stale reverse connection from {peer}"),
                Err(err) => {
                    debug!("Reverse backlog check failed: {err}");
                    break;
                }
            }
        }
    }

    /// Accepts one connection within `timeout` and reads it to EOF.
    ///
    /// Each read is bounded by the same timeout so a stalled peer cannot
    /// block forever.
    pub async fn receive(&self, timeout: Duration) -> Result<Vec<u8>> {
        let (mut conn, peer) = match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(accepted) => accepted?,
            Err(_) => return Err(DeviceError::AcceptTimeout(timeout)),
        };
        debug!("Reverse server accepted {peer}");

        let mut data = Vec::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let read = match tokio::time::timeout(timeout, conn.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => {
                    return Err(DeviceError::Timeout(format!(
                        "reverse server read stalled after {} bytes",
                        data.len()
                    )))
                }
            };
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
        }
        Ok(data)
    }
}
