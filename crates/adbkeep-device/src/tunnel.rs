use std::{
    collections::{HashMap, HashSet},
    fmt, io,
    net::TcpListener,
    ops::RangeInclusive,
};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::{DeviceError, Result};
use crate::ids::parse_tcp_spec;

/// Upper bound on random candidates tried before giving up on the range.
const MAX_PORT_PROBES: usize = 64;
/// Tunnel creation attempts when the bridge itself loses the bind race.
const CREATE_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Reverse => f.write_str("reverse"),
        }
    }
}

/// One row of the bridge's tunnel table.
///
/// `local_port` is always the port on this host; `remote` is the address
/// spec on the device side (`tcp:7903`, `localabstract:minitouch`, ...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tunnel {
    pub direction: Direction,
    pub serial: String,
    pub local_port: u16,
    pub remote: String,
}

impl Tunnel {
    pub fn local_spec(&self) -> String {
        format!("tcp:{}", self.local_port)
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}, {}, {})",
            self.direction,
            self.serial,
            self.local_spec(),
            self.remote
        )
    }
}

/// Parses `host:list-forward` output: `<serial> <local> <remote>` per line.
pub(crate) fn parse_forward_list(output: &str) -> Vec<Tunnel> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let local = parts.next()?;
            let remote = parts.next()?;
            Some(Tunnel {
                direction: Direction::Forward,
                serial: serial.to_string(),
                local_port: parse_tcp_spec(local)?,
                remote: remote.to_string(),
            })
        })
        .collect()
}

/// Parses `reverse:list-forward` output: `<transport> <remote> <local>` per line.
/// The transport column names the device's connection, not the serial, so
/// the caller's serial is stamped on every row.
pub(crate) fn parse_reverse_list(serial: &str, output: &str) -> Vec<Tunnel> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _transport = parts.next()?;
            let remote = parts.next()?;
            let local = parts.next()?;
            Some(Tunnel {
                direction: Direction::Reverse,
                serial: serial.to_string(),
                local_port: parse_tcp_spec(local)?,
                remote: remote.to_string(),
            })
        })
        .collect()
}

/// Allocates, reuses and releases forward/reverse tunnels for one controller.
///
/// The bridge's table is rescanned on every call; only the set of ports
/// this instance has handed out is remembered, so a candidate is never
/// given to two tunnels even before anything binds it.
pub struct PortTunnels {
    range: RangeInclusive<u16>,
    allocated: HashSet<u16>,
    /// Host port handed out for each reverse remote spec.
    reverse_ports: HashMap<String, u16>,
}

impl PortTunnels {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            allocated: HashSet::new(),
            reverse_ports: HashMap::new(),
        }
    }

    pub fn allocated(&self) -> &HashSet<u16> {
        &self.allocated
    }

    /// Forgets allocations tied to the previous serial.
    pub fn invalidate(&mut self) {
        self.allocated.clear();
        self.reverse_ports.clear();
    }

    pub async fn forward(&mut self, bridge: &dyn Bridge, serial: &str, remote: &str) -> Result<u16> {
        self.ensure(bridge, serial, remote, Direction::Forward).await
    }

    pub async fn reverse(&mut self, bridge: &dyn Bridge, serial: &str, remote: &str) -> Result<u16> {
        self.ensure(bridge, serial, remote, Direction::Reverse).await
    }

    async fn ensure(
        &mut self,
        bridge: &dyn Bridge,
        serial: &str,
        remote: &str,
        direction: Direction,
    ) -> Result<u16> {
        let matches: Vec<Tunnel> = bridge
            .list_tunnels(serial, direction)
            .await?
            .into_iter()
            .filter(|t| t.direction == direction && t.serial == serial && t.remote == remote)
            .collect();

        if let Some((kept, redundant)) = matches.split_first() {
            info!("Reuse {direction}: {kept}");
            for tunnel in redundant {
                info!("Remove redundant {direction}: {tunnel}");
                self.remove_tunnel(bridge, tunnel).await?;
            }
            // Reverse removal is keyed by the device-side spec, which the
            // kept tunnel shares; put it back.
            if direction == Direction::Reverse && !redundant.is_empty() {
                bridge.create_tunnel(kept).await?;
            }
            self.track(kept);
            return Ok(kept.local_port);
        }

        let mut last_err = None;
        for _ in 0..CREATE_ATTEMPTS {
            let tunnel = Tunnel {
                direction,
                serial: serial.to_string(),
                local_port: self.pick_port()?,
                remote: remote.to_string(),
            };
            info!("Create {direction}: {tunnel}");
            match bridge.create_tunnel(&tunnel).await {
                Ok(()) => {
                    self.track(&tunnel);
                    return Ok(tunnel.local_port);
                }
                Err(DeviceError::Adb(msg)) if msg.contains("cannot bind") => {
                    warn!("Port {} taken before {direction} was created: {msg}", tunnel.local_port);
                    self.allocated.insert(tunnel.local_port);
                    last_err = Some(DeviceError::Adb(msg));
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| no_free_port(&self.range)))
    }

    fn track(&mut self, tunnel: &Tunnel) {
        self.allocated.insert(tunnel.local_port);
        if tunnel.direction == Direction::Reverse {
            self.reverse_ports
                .insert(tunnel.remote.clone(), tunnel.local_port);
        }
    }

    /// Random candidate from the range that this instance has not handed
    /// out and that the OS lets us bind right now.
    pub(crate) fn pick_port(&self) -> Result<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_PORT_PROBES {
            let port = rng.gen_range(self.range.clone());
            if self.allocated.contains(&port) {
                continue;
            }
            if port_is_free(port) {
                return Ok(port);
            }
            debug!("Port {port} is in use, probing another");
        }
        Err(no_free_port(&self.range))
    }

    async fn remove_tunnel(&mut self, bridge: &dyn Bridge, tunnel: &Tunnel) -> Result<()> {
        match tunnel.direction {
            Direction::Forward => {
                self.remove_forward(bridge, &tunnel.serial, tunnel.local_port)
                    .await
            }
            Direction::Reverse => {
                self.remove_reverse(bridge, &tunnel.serial, &tunnel.remote)
                    .await
            }
        }
    }

    /// `killforward` for a host port. Removing an absent tunnel is not an error.
    pub async fn remove_forward(&mut self, bridge: &dyn Bridge, serial: &str, local_port: u16) -> Result<()> {
        let local = format!("tcp:{local_port}");
        tolerate_missing(bridge.remove_forward(serial, &local).await, &local)?;
        self.allocated.remove(&local_port);
        Ok(())
    }

    /// `reverse:killforward` for a device-side spec. Idempotent.
    pub async fn remove_reverse(&mut self, bridge: &dyn Bridge, serial: &str, remote: &str) -> Result<()> {
        tolerate_missing(bridge.remove_reverse(serial, remote).await, remote)?;
        if let Some(port) = self.reverse_ports.remove(remote) {
            self.allocated.remove(&port);
        }
        Ok(())
    }
}

fn tolerate_missing(result: Result<()>, spec: &str) -> Result<()> {
    match result {
        Err(DeviceError::Adb(msg)) if msg.contains("not found") => {
            debug!("Tunnel {spec} already removed: {msg}");
            Ok(())
        }
        other => other,
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn no_free_port(range: &RangeInclusive<u16>) -> DeviceError {
    DeviceError::Io(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!(
            "no free port in {}..={}",
            range.start(),
            range.end()
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBridge;

    const SERIAL: &str = "127.0.0.1:5555";

    fn tunnels() -> PortTunnels {
        PortTunnels::new(41000..=41999)
    }

    fn row(direction: Direction, serial: &str, port: u16, remote: &str) -> Tunnel {
        Tunnel {
            direction,
            serial: serial.into(),
            local_port: port,
            remote: remote.into(),
        }
    }

    #[test]
    fn parses_forward_and_reverse_tables() {
        let forward = parse_forward_list(
            "127.0.0.1:5555 tcp:20001 tcp:7912\nemulator-5554 localabstract:x tcp:1\n",
        );
        assert_eq!(forward, vec![row(Direction::Forward, SERIAL, 20001, "tcp:7912")]);

        let reverse = parse_reverse_list(SERIAL, "host-19 tcp:7903 tcp:20555\n");
        assert_eq!(reverse, vec![row(Direction::Reverse, SERIAL, 20555, "tcp:7903")]);
    }

    #[tokio::test]
    async fn forward_twice_returns_same_port() {
        let bridge = FakeBridge::new();
        let mut tunnels = tunnels();
        let first = tunnels.forward(&bridge, SERIAL, "tcp:7912").await.unwrap();
        let second = tunnels.forward(&bridge, SERIAL, "tcp:7912").await.unwrap();
        assert_eq!(first, second);
        assert!((41000..=41999).contains(&first));
        assert_eq!(bridge.tunnels(Direction::Forward).len(), 1);
    }

    #[tokio::test]
    async fn duplicate_forwards_collapse_to_the_first() {
        let bridge = FakeBridge::new();
        bridge.add_tunnel(row(Direction::Forward, SERIAL, 20010, "tcp:7912"));
        bridge.add_tunnel(row(Direction::Forward, SERIAL, 20011, "tcp:7912"));
        bridge.add_tunnel(row(Direction::Forward, SERIAL, 20012, "tcp:7912"));
        bridge.add_tunnel(row(Direction::Forward, "emulator-5554", 20013, "tcp:7912"));

        let port = tunnels().forward(&bridge, SERIAL, "tcp:7912").await.unwrap();
        assert_eq!(port, 20010);

        let remaining = bridge.tunnels(Direction::Forward);
        assert_eq!(
            remaining,
            vec![
                row(Direction::Forward, SERIAL, 20010, "tcp:7912"),
                row(Direction::Forward, "emulator-5554", 20013, "tcp:7912"),
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_reverses_collapse_to_the_first() {
        let bridge = FakeBridge::new();
        bridge.add_tunnel(row(Direction::Reverse, SERIAL, 20020, "tcp:7903"));
        bridge.add_tunnel(row(Direction::Reverse, SERIAL, 20021, "tcp:7903"));

        let port = tunnels().reverse(&bridge, SERIAL, "tcp:7903").await.unwrap();
        assert_eq!(port, 20020);
        assert_eq!(
            bridge.tunnels(Direction::Reverse),
            vec![row(Direction::Reverse, SERIAL, 20020, "tcp:7903")]
        );
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let bridge = FakeBridge::new();
        let mut tunnels = tunnels();
        let port = tunnels.forward(&bridge, SERIAL, "tcp:7912").await.unwrap();
        tunnels.remove_forward(&bridge, SERIAL, port).await.unwrap();
        tunnels.remove_forward(&bridge, SERIAL, port).await.unwrap();
        assert!(bridge.tunnels(Direction::Forward).is_empty());
        assert!(!tunnels.allocated().contains(&port));

        tunnels.remove_reverse(&bridge, SERIAL, "tcp:7903").await.unwrap();
    }

    #[tokio::test]
    async fn reverse_removal_releases_its_port() {
        let bridge = FakeBridge::new();
        let mut tunnels = tunnels();
        let port = tunnels.reverse(&bridge, SERIAL, "tcp:7903").await.unwrap();
        assert!(tunnels.allocated().contains(&port));

        tunnels.remove_reverse(&bridge, SERIAL, "tcp:7903").await.unwrap();
        assert!(tunnels.allocated().is_empty());
        assert!(bridge.tunnels(Direction::Reverse).is_empty());
    }

    #[tokio::test]
    async fn lost_bind_races_pick_new_candidates() {
        let bridge = FakeBridge::new();
        for _ in 0..2 {
            bridge.script_create(Err(DeviceError::Adb(
                "cannot bind listener: Address already in use".into(),
            )));
        }
        let mut tunnels = tunnels();
        let port = tunnels.forward(&bridge, SERIAL, "tcp:7912").await.unwrap();
        assert_eq!(bridge.count("create-forward"), 3);
        assert_eq!(bridge.tunnels(Direction::Forward)[0].local_port, port);
        // The two ports the bridge refused stay off limits.
        assert_eq!(tunnels.allocated().len(), 3);
    }

    #[test]
    fn pick_port_skips_ports_bound_by_the_os() {
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        let tunnels = PortTunnels::new(busy..=busy);
        assert!(matches!(tunnels.pick_port(), Err(DeviceError::Io(_))));
    }

    #[test]
    fn pick_port_skips_tracked_allocations() {
        let mut tunnels = PortTunnels::new(42000..=42001);
        tunnels.allocated.insert(42000);
        for _ in 0..10 {
            assert_eq!(tunnels.pick_port().unwrap(), 42001);
        }
    }
}
