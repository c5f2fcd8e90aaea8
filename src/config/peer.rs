use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::io;
use std::net::{IpAddr, SocketAddr};

/// A remote node and the addresses it is authoritative for.
///
/// The first allowed address is the peer's canonical key: the registry files
/// the peer's client under it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PeerEntry", into = "PeerEntry")]
pub struct Peer {
    endpoint: String,
    host: String,
    port: u16,
    allowed_ips: Vec<IpAddr>,
}

#[derive(Serialize, Deserialize)]
struct PeerEntry {
    endpoint: String,
    allowed_ips: Vec<IpAddr>,
}

impl TryFrom<PeerEntry> for Peer {
    type Error = Error;

    fn try_from(value: PeerEntry) -> Result<Self> {
        Peer::new(value.endpoint, value.allowed_ips)
    }
}

impl From<Peer> for PeerEntry {
    fn from(value: Peer) -> Self {
        PeerEntry {
            endpoint: value.endpoint,
            allowed_ips: value.allowed_ips,
        }
    }
}

impl Peer {
    pub fn new<S: Into<String>>(endpoint: S, allowed_ips: Vec<IpAddr>) -> Result<Self> {
        let endpoint = endpoint.into();
        let (host, port) = split_host_port(&endpoint)?;
        if allowed_ips.is_empty() {
            return Err(Error::Config(format!(
                "peer {endpoint} has no allowed_ips"
            )));
        }
        Ok(Self {
            endpoint,
            host,
            port,
            allowed_ips,
        })
    }
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
    /// Host portion of the endpoint, the key connections are shared under.
    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn allowed_ips(&self) -> &[IpAddr] {
        &self.allowed_ips
    }
    pub fn canonical_address(&self) -> IpAddr {
        self.allowed_ips[0]
    }
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} did not resolve", self.endpoint),
                )
            })
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [ {} ]", self.endpoint, self.canonical_address())
    }
}

/// Split `host:port` or `[v6]:port`.
pub fn split_host_port(endpoint: &str) -> Result<(String, u16)> {
    let invalid = || Error::Config(format!("invalid endpoint {endpoint:?}, expected host:port"));
    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, port)
    } else {
        let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            return Err(invalid());
        }
        (host, port)
    };
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Static, config-derived set of peers.
#[derive(Clone, Debug, Default)]
pub struct PeerDirectory {
    peers: Vec<Peer>,
}

impl PeerDirectory {
    pub fn new(peers: Vec<Peer>) -> Result<Self> {
        let mut seen = HashSet::new();
        for peer in &peers {
            for ip in peer.allowed_ips() {
                if !seen.insert(*ip) {
                    return Err(Error::Config(format!(
                        "allowed ip {ip} is claimed by more than one peer"
                    )));
                }
            }
        }
        Ok(Self { peers })
    }
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }
    pub fn len(&self) -> usize {
        self.peers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
