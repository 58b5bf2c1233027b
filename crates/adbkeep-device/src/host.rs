use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

use crate::bridge::Bridge;
use crate::error::{DeviceError, Result};
use crate::tunnel::{parse_forward_list, parse_reverse_list, Direction, Tunnel};

const MAX_REQUEST_LEN: usize = 0xffff;

/// Client for the bridge daemon's host service on a loopback address.
///
/// Every request opens a fresh socket and is bounded by `timeout`.
#[derive(Clone, Debug)]
pub struct AdbHost {
    addr: String,
    timeout: Duration,
}

impl AdbHost {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(format!(
                "{what} exceeded {:?}",
                self.timeout
            ))),
        }
    }

    async fn open(&self) -> Result<HostStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(HostStream { stream })
    }

    /// Opens a socket already switched to `serial`'s transport.
    async fn open_transport(&self, serial: &str) -> Result<HostStream> {
        let mut conn = self.open().await?;
        conn.request(&format!("host:transport:{serial}")).await?;
        Ok(conn)
    }

    /// One-shot host request whose reply is a length-prefixed string.
    async fn query(&self, command: &str) -> Result<String> {
        let mut conn = self.open().await?;
        conn.request(command).await?;
        conn.read_block().await
    }
}

struct HostStream {
    stream: TcpStream,
}

impl HostStream {
    async fn send(&mut self, command: &str) -> Result<()> {
        debug!("adb >> {command}");
        let request = encode_request(command)?;
        self.stream.write_all(request.as_bytes()).await?;
        Ok(())
    }

    async fn check_okay(&mut self) -> Result<()> {
        let mut status = [0u8; 4];
        self.stream.read_exact(&mut status).await?;
        match &status {
            b"OKAY" => Ok(()),
            b"FAIL" => {
                let message = self.read_block().await?;
                Err(DeviceError::Adb(message))
            }
            other => Err(DeviceError::Adb(format!(
                "unexpected status {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    async fn request(&mut self, command: &str) -> Result<()> {
        self.send(command).await?;
        self.check_okay().await
    }

    async fn read_block(&mut self) -> Result<String> {
        let mut len_hex = [0u8; 4];
        self.stream.read_exact(&mut len_hex).await?;
        let len_str = std::str::from_utf8(&len_hex)
            .map_err(|_| DeviceError::Adb(format!("bad length prefix {len_hex:?}")))?;
        let len = usize::from_str_radix(len_str, 16)
            .map_err(|_| DeviceError::Adb(format!("bad length prefix {len_str:?}")))?;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.stream.read_to_end(&mut out).await?;
        Ok(out)
    }
}

/// Four hex digits of length, then the payload.
fn encode_request(command: &str) -> Result<String> {
    if command.len() > MAX_REQUEST_LEN {
        return Err(DeviceError::Adb(format!(
            "request of {} bytes exceeds the {MAX_REQUEST_LEN} byte limit",
            command.len()
        )));
    }
    Ok(format!("{:04x}{command}", command.len()))
}

#[async_trait]
impl Bridge for AdbHost {
    async fn devices(&self) -> Result<String> {
        self.bounded("host:devices", self.query("host:devices")).await
    }

    async fn connect(&self, serial: &str) -> Result<String> {
        let command = format!("host:connect:{serial}");
        self.bounded(&command, self.query(&command)).await
    }

    async fn disconnect(&self, serial: &str) -> Result<String> {
        let command = format!("host:disconnect:{serial}");
        self.bounded(&command, self.query(&command)).await
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        self.bounded("shell", async {
            let mut conn = self.open_transport(serial).await?;
            conn.request(&format!("shell:{command}")).await?;
            let output = conn.read_to_end().await?;
            Ok(String::from_utf8_lossy(&output).into_owned())
        })
        .await
    }

    async fn shell_detached(&self, serial: &str, command: &str) -> Result<()> {
        let mut conn = self
            .bounded("shell", async {
                let mut conn = self.open_transport(serial).await?;
                conn.request(&format!("shell:{command}")).await?;
                Ok(conn)
            })
            .await?;
        let limit = self.timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(limit, conn.read_to_end()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => debug!("detached shell ended: {err}"),
                Err(_) => debug!("detached shell still running after {limit:?}, closing it"),
            }
        });
        Ok(())
    }

    async fn list_tunnels(&self, serial: &str, direction: Direction) -> Result<Vec<Tunnel>> {
        match direction {
            Direction::Forward => {
                let output = self
                    .bounded("host:list-forward", self.query("host:list-forward"))
                    .await?;
                Ok(parse_forward_list(&output))
            }
            Direction::Reverse => {
                let output = self
                    .bounded("reverse:list-forward", async {
                        let mut conn = self.open_transport(serial).await?;
                        conn.request("reverse:list-forward").await?;
                        conn.read_block().await
                    })
                    .await?;
                Ok(parse_reverse_list(serial, &output))
            }
        }
    }

    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<()> {
        let local = tunnel.local_spec();
        match tunnel.direction {
            Direction::Forward => {
                let command = format!(
                    "host-serial:{}:forward:{};{}",
                    tunnel.serial, local, tunnel.remote
                );
                self.bounded(&command, async {
                    let mut conn = self.open().await?;
                    conn.request(&command).await
                })
                .await
            }
            Direction::Reverse => {
                let command = format!("reverse:forward:{};{}", tunnel.remote, local);
                self.bounded(&command, async {
                    let mut conn = self.open_transport(&tunnel.serial).await?;
                    conn.request(&command).await
                })
                .await
            }
        }
    }

    async fn remove_forward(&self, serial: &str, local: &str) -> Result<()> {
        let command = format!("host-serial:{serial}:killforward:{local}");
        self.bounded(&command, async {
            let mut conn = self.open().await?;
            conn.request(&command).await
        })
        .await
    }

    async fn remove_reverse(&self, serial: &str, remote: &str) -> Result<()> {
        let command = format!("reverse:killforward:{remote}");
        self.bounded(&command, async {
            let mut conn = self.open_transport(serial).await?;
            conn.request(&command).await
        })
        .await
    }
}
