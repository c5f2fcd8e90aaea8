//! # quicmesh - a peer-to-peer mesh VPN over QUIC
//!
//! Every node owns a TUN device and keeps one QUIC session per remote host.
//! Packets read from the device are sent to the peer that owns their
//! destination address; packets received from peers are written back into the
//! device unchanged.
//!
//! Startup runs in a fixed order: the device is created and brought up, the
//! NAT in front of the listen port is classified, the endpoint is bound (and
//! accepts inbound sessions only when the NAT allows it), one dial task is
//! spawned per configured peer, and finally the outbound router starts.
//!
//! ```rust,no_run
//! use quicmesh::config::MeshConfig;
//! use quicmesh::QuicMesh;
//!
//! # #[tokio::main]
//! # async fn main() -> quicmesh::error::Result<()> {
//! let config = MeshConfig::load("quicmesh.json")?;
//! let mesh = QuicMesh::new(config)?;
//! mesh.start().await?;
//! mesh.wait().await;
//! mesh.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
mod context;
pub mod dial;
pub mod error;
pub mod mesh;
pub mod nat_gate;
pub mod registry;
pub mod router;
mod server;
#[cfg(test)]
pub(crate) mod testing;

pub use client::Client;
pub use dial::{DialOutcome, DialState};
pub use error::{Error, Result};
pub use mesh::{MeshBackend, MeshOptions, QuicMesh, SystemBackend};
pub use nat_gate::NatGate;
pub use registry::ConnectionRegistry;
pub use router::StatsSnapshot;

pub use quicmesh_core;
