// Server configuration and switch topology.
//
// `FabricConfig` is the one place the coordinator reads its settings from:
// the CLI in `main.rs` (or an embedding test) fills it in and hands it to
// `Coordinator::new`. There is no process-wide state outside it.
//
// `Topology` is the table the switch fabric forwards by. It lists which MAC
// address lives behind which port (`stations`), optional default peers for
// frames whose destination is not known (`links`), and whether the switch
// may learn addresses from traffic. It can be loaded from TOML:
//
//   learning = false
//
//   [[stations]]
//   port = 0
//   mac = "00:10:aa:00:00:01"
//
//   [[links]]
//   from = 0
//   to = 1

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fabric_protocol::{MacAddress, PortIndex};
use serde::{Deserialize, Serialize};

use crate::error::{FabricError, FabricResult};

/// Default port for session 0; session `i` listens on `DEFAULT_BASE_PORT + i`.
pub const DEFAULT_BASE_PORT: u16 = 50101;

/// Default number of clients.
pub const DEFAULT_SESSION_COUNT: usize = 4;

/// Default reset interval handed to clients, in nanoseconds.
pub const DEFAULT_RESET_INTERVAL_NS: u64 = 100;

/// Socket addressing family for session endpoints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Domain {
    /// Unix-domain sockets under `socket_dir`, reachable only from this host.
    #[default]
    Local,
    /// TCP on `address:base_port + index`.
    Networked,
}

/// What the reset barrier does when a session closes before release.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QuorumPolicy {
    /// Fail the epoch for every waiter.
    #[default]
    Abort,
    /// Drop the closed session from the quorum and release once every
    /// remaining session is ready.
    Exclude,
}

/// A station: the MAC address reachable through a port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Station {
    pub port: PortIndex,
    pub mac: MacAddress,
}

/// Default peer for frames from `from` whose destination is unknown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Link {
    pub from: PortIndex,
    pub to: PortIndex,
}

/// Forwarding configuration for the switch fabric.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    #[serde(default)]
    pub stations: Vec<Station>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub learning: bool,
}

impl Topology {
    /// One station per port with MAC `00:10:aa:00:00:<port + 1>`, the
    /// addressing plan the simulation clients ship with.
    pub fn default_for(ports: usize) -> Self {
        let stations = (0..ports)
            .map(|i| {
                let [hi, lo] = u16::try_from(i + 1).unwrap_or(u16::MAX).to_be_bytes();
                Station {
                    port: PortIndex(i as u32),
                    mac: MacAddress([0x00, 0x10, 0xaa, 0x00, hi, lo]),
                }
            })
            .collect();
        Self {
            stations,
            links: Vec::new(),
            learning: false,
        }
    }

    pub fn from_toml_str(text: &str) -> FabricResult<Self> {
        toml::from_str(text).map_err(|e| FabricError::Argument(format!("topology: {e}")))
    }

    pub fn load(path: &Path) -> FabricResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FabricError::Argument(format!("cannot read topology {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check the table against a switch with `ports` ports.
    pub fn validate(&self, ports: usize) -> FabricResult<()> {
        let in_range = |port: PortIndex| port.as_usize() < ports;
        let mut seen = BTreeSet::new();
        for station in &self.stations {
            if !in_range(station.port) {
                return Err(FabricError::Argument(format!(
                    "topology: station {} on {} but the switch has {ports} ports",
                    station.mac, station.port
                )));
            }
            if station.mac.is_group() {
                return Err(FabricError::Argument(format!(
                    "topology: station address {} is a group address",
                    station.mac
                )));
            }
            if !seen.insert(station.mac) {
                return Err(FabricError::Argument(format!(
                    "topology: station address {} listed twice",
                    station.mac
                )));
            }
        }
        let mut linked = BTreeSet::new();
        for link in &self.links {
            if !in_range(link.from) || !in_range(link.to) {
                return Err(FabricError::Argument(format!(
                    "topology: link {} -> {} is outside the {ports}-port switch",
                    link.from.0, link.to.0
                )));
            }
            if link.from == link.to {
                return Err(FabricError::Argument(format!(
                    "topology: {} linked to itself",
                    link.from
                )));
            }
            if !linked.insert(link.from) {
                return Err(FabricError::Argument(format!(
                    "topology: {} has more than one default link",
                    link.from
                )));
            }
        }
        Ok(())
    }
}

/// Everything the coordinator needs to run.
#[derive(Clone, Debug)]
pub struct FabricConfig {
    pub domain: Domain,
    /// Host address for the networked domain.
    pub address: String,
    pub base_port: u16,
    pub session_count: usize,
    /// Directory holding local-domain socket files.
    pub socket_dir: PathBuf,
    /// How far a session may run ahead of the authorized time, in ns.
    pub lookahead: u64,
    pub reset_interval: u64,
    pub quorum: QuorumPolicy,
    /// When false, monitor taps are never invoked.
    pub monitoring: bool,
    /// Give up waiting for clients after this long. `None` waits forever.
    pub accept_timeout: Option<Duration>,
    /// Read timeout for the `Hello` handshake.
    pub handshake_timeout: Duration,
    /// Explicit forwarding table; `None` uses `Topology::default_for`.
    pub topology: Option<Topology>,
    pub command_file: Option<PathBuf>,
    /// Append every monitored frame to this file as JSON lines.
    pub monitor_log: Option<PathBuf>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            domain: Domain::default(),
            address: "127.0.0.1".into(),
            base_port: DEFAULT_BASE_PORT,
            session_count: DEFAULT_SESSION_COUNT,
            socket_dir: std::env::temp_dir(),
            lookahead: 0,
            reset_interval: DEFAULT_RESET_INTERVAL_NS,
            quorum: QuorumPolicy::default(),
            monitoring: true,
            accept_timeout: None,
            handshake_timeout: Duration::from_secs(5),
            topology: None,
            command_file: None,
            monitor_log: None,
        }
    }
}

impl FabricConfig {
    /// The forwarding table in effect.
    pub fn topology(&self) -> Topology {
        self.topology
            .clone()
            .unwrap_or_else(|| Topology::default_for(self.session_count))
    }

    pub fn validate(&self) -> FabricResult<()> {
        if self.session_count == 0 {
            return Err(FabricError::Argument(
                "at least one client session is required".into(),
            ));
        }
        if u32::try_from(self.session_count).is_err() {
            return Err(FabricError::Argument(format!(
                "{} sessions is more than the protocol can index",
                self.session_count
            )));
        }
        if self.base_port != 0 {
            let last = usize::from(self.base_port) + self.session_count - 1;
            if last > usize::from(u16::MAX) {
                return Err(FabricError::Argument(format!(
                    "base port {} leaves no room for {} sessions",
                    self.base_port, self.session_count
                )));
            }
        }
        if self.domain == Domain::Local && self.base_port == 0 {
            return Err(FabricError::Argument(
                "local domain needs a non-zero base port to name its sockets".into(),
            ));
        }
        self.topology().validate(self.session_count)
    }
}
