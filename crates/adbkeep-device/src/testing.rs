use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::bridge::Bridge;
use crate::error::{DeviceError, Result};
use crate::ids::parse_tcp_spec;
use crate::tunnel::{Direction, Tunnel};

#[derive(Default)]
struct Inner {
    devices: String,
    connect_replies: VecDeque<Result<String>>,
    create_replies: VecDeque<Result<()>>,
    shell_replies: HashMap<String, VecDeque<Result<String>>>,
    payloads: HashMap<String, Vec<u8>>,
    tunnels: Vec<Tunnel>,
    log: Vec<String>,
}

/// In-memory bridge daemon. Scripted replies are consumed in order;
/// unscripted shells answer with empty output and unscripted connects
/// with `already connected to <serial>`.
#[derive(Default)]
pub(crate) struct FakeBridge {
    inner: Mutex<Inner>,
}

impl FakeBridge {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_devices(devices: &str) -> Self {
        let bridge = Self::new();
        bridge.inner.lock().unwrap().devices = devices.to_string();
        bridge
    }

    pub(crate) fn script_connect(&self, reply: Result<String>) {
        self.inner.lock().unwrap().connect_replies.push_back(reply);
    }

    /// Reply for the next tunnel creation; the tunnel is only added on `Ok`.
    pub(crate) fn script_create(&self, reply: Result<()>) {
        self.inner.lock().unwrap().create_replies.push_back(reply);
    }

    pub(crate) fn script_shell(&self, command: &str, reply: Result<String>) {
        self.inner
            .lock()
            .unwrap()
            .shell_replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Bytes the device pushes through `nc` when `command` is relayed.
    pub(crate) fn set_payload(&self, command: &str, payload: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .payloads
            .insert(command.to_string(), payload.to_vec());
    }

    pub(crate) fn add_tunnel(&self, tunnel: Tunnel) {
        self.inner.lock().unwrap().tunnels.push(tunnel);
    }

    pub(crate) fn tunnels(&self, direction: Direction) -> Vec<Tunnel> {
        self.inner
            .lock()
            .unwrap()
            .tunnels
            .iter()
            .filter(|t| t.direction == direction)
            .cloned()
            .collect()
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|l| l.starts_with(prefix)).count()
    }

    fn record(&self, entry: String) {
        self.inner.lock().unwrap().log.push(entry);
    }
}

#[async_trait]
impl Bridge for FakeBridge {
    async fn devices(&self) -> Result<String> {
        self.record("host:devices".into());
        Ok(self.inner.lock().unwrap().devices.clone())
    }

    async fn connect(&self, serial: &str) -> Result<String> {
        self.record(format!("host:connect:{serial}"));
        let reply = self.inner.lock().unwrap().connect_replies.pop_front();
        reply.unwrap_or_else(|| Ok(format!("already connected to {serial}")))
    }

    async fn disconnect(&self, serial: &str) -> Result<String> {
        self.record(format!("host:disconnect:{serial}"));
        Ok(format!("disconnected {serial}"))
    }

    async fn shell(&self, _serial: &str, command: &str) -> Result<String> {
        self.record(format!("shell:{command}"));
        let reply = self
            .inner
            .lock()
            .unwrap()
            .shell_replies
            .get_mut(command)
            .and_then(VecDeque::pop_front);
        reply.unwrap_or_else(|| Ok(String::new()))
    }

    async fn shell_detached(&self, serial: &str, command: &str) -> Result<()> {
        self.record(format!("shell-detached:{command}"));
        let Some((inner_cmd, target)) = command.split_once(" | nc 127.0.0.1 ") else {
            return Ok(());
        };
        let remote = format!("tcp:{}", target.trim());
        let (payload, local_port) = {
            let inner = self.inner.lock().unwrap();
            let payload = inner.payloads.get(inner_cmd).cloned();
            let local_port = inner
                .tunnels
                .iter()
                .find(|t| t.direction == Direction::Reverse && t.serial == serial && t.remote == remote)
                .map(|t| t.local_port);
            (payload, local_port)
        };
        if let (Some(payload), Some(port)) = (payload, local_port) {
            tokio::spawn(async move {
                if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)).await {
                    let _ = stream.write_all(&payload).await;
                    let _ = stream.shutdown().await;
                }
            });
        }
        Ok(())
    }

    async fn list_tunnels(&self, serial: &str, direction: Direction) -> Result<Vec<Tunnel>> {
        self.record(format!("list-{direction}"));
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tunnels
            .iter()
            .filter(|t| {
                t.direction == direction
                    && (direction == Direction::Forward || t.serial == serial)
            })
            .cloned()
            .collect())
    }

    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<()> {
        self.record(format!("create-{}:{}", tunnel.direction, tunnel.remote));
        let mut inner = self.inner.lock().unwrap();
        if let Some(Err(err)) = inner.create_replies.pop_front() {
            return Err(err);
        }
        inner.tunnels.retain(|t| {
            let same = match tunnel.direction {
                Direction::Forward => t.local_port == tunnel.local_port,
                Direction::Reverse => t.serial == tunnel.serial && t.remote == tunnel.remote,
            };
            !(t.direction == tunnel.direction && same)
        });
        inner.tunnels.push(tunnel.clone());
        Ok(())
    }

    async fn remove_forward(&self, serial: &str, local: &str) -> Result<()> {
        self.record(format!("killforward:{local}"));
        let port = parse_tcp_spec(local);
        let mut inner = self.inner.lock().unwrap();
        let before = inner.tunnels.len();
        inner.tunnels.retain(|t| {
            !(t.direction == Direction::Forward && t.serial == serial && Some(t.local_port) == port)
        });
        if inner.tunnels.len() == before {
            return Err(DeviceError::Adb(format!("listener '{local}' not found")));
        }
        Ok(())
    }

    async fn remove_reverse(&self, serial: &str, remote: &str) -> Result<()> {
        self.record(format!("reverse:killforward:{remote}"));
        let mut inner = self.inner.lock().unwrap();
        let before = inner.tunnels.len();
        inner.tunnels.retain(|t| {
            !(t.direction == Direction::Reverse && t.serial == serial && t.remote == remote)
        });
        if inner.tunnels.len() == before {
            return Err(DeviceError::Adb(format!("listener '{remote}' not found")));
        }
        Ok(())
    }
}
