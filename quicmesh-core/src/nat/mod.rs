//! NAT (Network Address Translation) detection.
//!
//! Classifies the local NAT as cone or symmetric by comparing the mapped
//! addresses several STUN servers observe for one local socket, and reports
//! the externally visible binding of the listen port.
//!
//! # Examples
//!
//! ```rust
//! use quicmesh_core::nat::{nat_type_from_mappings, NatType};
//! use std::net::SocketAddr;
//!
//! let mapped: [SocketAddr; 2] = ["203.0.113.7:5000".parse().unwrap(), "203.0.113.7:5000".parse().unwrap()];
//! assert_eq!(nat_type_from_mappings(&mapped), Some(NatType::Cone));
//! ```

use crate::socket::bind_tokio_udp;
use crate::stun;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Type of NAT.
///
/// - `Cone` - port mapping is consistent, inbound sessions can be accepted
/// - `Symmetric` - port mapping changes per destination, unsolicited inbound fails
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub enum NatType {
    #[default]
    Cone,
    Symmetric,
}

impl NatType {
    #[inline]
    pub fn is_cone(&self) -> bool {
        self == &NatType::Cone
    }

    #[inline]
    pub fn is_symmetric(&self) -> bool {
        self == &NatType::Symmetric
    }
}

/// NAT discovery port consumed by the mesh gate.
#[async_trait]
pub trait NatDiscovery: Send + Sync {
    /// Classify the NAT in front of `port`.
    async fn classify(&self, port: u16) -> io::Result<NatType>;
    /// Externally observed address for `port`.
    async fn port_binding(&self, port: u16) -> io::Result<SocketAddr>;
}

/// Derive the NAT type from the addresses distinct servers mapped one socket to.
///
/// Needs at least two observations; `None` otherwise.
pub fn nat_type_from_mappings(mapped: &[SocketAddr]) -> Option<NatType> {
    let (first, rest) = mapped.split_first()?;
    if rest.is_empty() {
        return None;
    }
    if rest.iter().all(|addr| addr == first) {
        Some(NatType::Cone)
    } else {
        Some(NatType::Symmetric)
    }
}

pub const DEFAULT_STUN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct StunNatDiscovery {
    servers: Vec<String>,
    timeout: Duration,
}

impl StunNatDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            timeout: DEFAULT_STUN_TIMEOUT,
        }
    }
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn stun_socket(&self, port: u16) -> io::Result<tokio::net::UdpSocket> {
        bind_tokio_udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into(), true)
    }

    async fn mappings(&self, port: u16, want: usize) -> io::Result<Vec<SocketAddr>> {
        if self.servers.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no stun servers configured",
            ));
        }
        let socket = self.stun_socket(port)?;
        let mut mapped = Vec::with_capacity(want);
        for server in &self.servers {
            match stun::query_mapped_addr(&socket, server, self.timeout).await {
                Ok(addr) => {
                    log::debug!("stun {server} mapped local port {port} to {addr}");
                    mapped.push(addr);
                    if mapped.len() >= want {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("stun {server} {e:?}");
                }
            }
        }
        Ok(mapped)
    }
}

#[async_trait]
impl NatDiscovery for StunNatDiscovery {
    async fn classify(&self, port: u16) -> io::Result<NatType> {
        let mapped = self.mappings(port, 3).await?;
        nat_type_from_mappings(&mapped).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "nat classification needs two stun answers, got {}",
                    mapped.len()
                ),
            )
        })
    }

    async fn port_binding(&self, port: u16) -> io::Result<SocketAddr> {
        self.mappings(port, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "stun binding request failed"))
    }
}
