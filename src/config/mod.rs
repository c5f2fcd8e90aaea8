use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use quicmesh_core::device::{DeviceConfig, DEFAULT_MTU, DEFAULT_PREFIX_LEN};
use serde::{Deserialize, Serialize};

mod peer;

pub use peer::{split_host_port, Peer, PeerDirectory};

pub(crate) const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_ATTEMPTS: usize = 10;
const MIN_MTU: u16 = 576;

/// Local node settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Address the QUIC endpoint binds to.
    pub local_node_ip: IpAddr,
    /// Address assigned to the virtual device.
    pub local_endpoint: Ipv4Addr,
    pub listen_port: u16,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_prefix_len() -> u8 {
    DEFAULT_PREFIX_LEN
}
fn default_mtu() -> u16 {
    DEFAULT_MTU
}
fn default_nat_check() -> bool {
    true
}

impl InterfaceConfig {
    pub fn new(local_node_ip: IpAddr, local_endpoint: Ipv4Addr, listen_port: u16) -> Self {
        Self {
            local_node_ip,
            local_endpoint,
            listen_port,
            prefix_len: DEFAULT_PREFIX_LEN,
            mtu: DEFAULT_MTU,
        }
    }
    pub fn set_prefix_len(mut self, prefix_len: u8) -> Self {
        self.prefix_len = prefix_len;
        self
    }
    pub fn set_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_node_ip, self.listen_port)
    }
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig::new(self.local_endpoint)
            .set_prefix_len(self.prefix_len)
            .set_mtu(self.mtu)
    }
}

/// Retry budget of a peer's dial task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialPolicy {
    pub retry_interval_ms: u64,
    pub max_attempts: usize,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl DialPolicy {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
    pub fn set_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval_ms = retry_interval.as_millis() as u64;
        self
    }
    pub fn set_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

pub(crate) fn default_stun_servers() -> Vec<String> {
    vec![
        "stun.l.google.com:19302".to_string(),
        "stun1.l.google.com:19302".to_string(),
        "stun2.l.google.com:19302".to_string(),
        "stun.cloudflare.com:3478".to_string(),
    ]
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub dial: DialPolicy,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Classify the NAT before accepting inbound sessions.
    #[serde(default = "default_nat_check")]
    pub nat_check: bool,
}

impl MeshConfig {
    pub fn new(interface: InterfaceConfig) -> Self {
        Self {
            interface,
            peers: Vec::new(),
            dial: DialPolicy::default(),
            stun_servers: default_stun_servers(),
            nat_check: true,
        }
    }
    pub fn set_peers(mut self, peers: Vec<Peer>) -> Self {
        self.peers = peers;
        self
    }
    pub fn add_peer(mut self, peer: Peer) -> Self {
        self.peers.push(peer);
        self
    }
    pub fn set_dial_policy(mut self, dial: DialPolicy) -> Self {
        self.dial = dial;
        self
    }
    pub fn set_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }
    pub fn set_nat_check(mut self, nat_check: bool) -> Self {
        self.nat_check = nat_check;
        self
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: MeshConfig =
            serde_json::from_str(&text).map_err(|source| Error::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: MeshConfig =
            serde_json::from_str(text).map_err(|source| Error::ConfigParse {
                path: "<inline>".into(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.prefix_len > 32 {
            return Err(Error::Config(format!(
                "prefix_len {} out of range",
                self.interface.prefix_len
            )));
        }
        if self.interface.mtu < MIN_MTU {
            return Err(Error::Config(format!(
                "mtu {} below {MIN_MTU}",
                self.interface.mtu
            )));
        }
        if self.dial.max_attempts == 0 {
            return Err(Error::Config("dial.max_attempts must be at least 1".into()));
        }
        if self.nat_check && self.stun_servers.len() < 2 {
            return Err(Error::Config(
                "nat_check needs at least two stun_servers".into(),
            ));
        }
        self.peer_directory().map(|_| ())
    }

    pub fn peer_directory(&self) -> Result<PeerDirectory> {
        PeerDirectory::new(self.peers.clone())
    }
}
