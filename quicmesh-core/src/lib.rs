//! # quicmesh-core - ports of the quicmesh overlay
//!
//! `quicmesh-core` holds the collaborators the mesh orchestrator talks to:
//! the QUIC transport, STUN based NAT discovery and the virtual network device.
//! Each one is exposed as a trait so the orchestrator in `quicmesh` can be
//! driven by the concrete adapters here or by in-memory doubles.
//!
//! ## Modules
//!
//! - [`transport`] - QUIC sessions, packet framing and the inbound handler contract
//! - [`nat`] - NAT type classification and external port binding
//! - [`stun`] - STUN binding request/response encoding
//! - [`device`] - TUN device creation and whole-packet I/O
//! - [`socket`] - UDP socket creation shared by STUN probing and QUIC
//!
//! ## NAT classification
//!
//! ```rust,no_run
//! use quicmesh_core::nat::{NatDiscovery, StunNatDiscovery};
//!
//! # #[tokio::main]
//! # async fn main() -> std::io::Result<()> {
//! let discovery = StunNatDiscovery::new(vec![
//!     "stun.l.google.com:19302".to_string(),
//!     "stun1.l.google.com:19302".to_string(),
//! ]);
//! let nat_type = discovery.classify(5000).await?;
//! if nat_type.is_cone() {
//!     let binding = discovery.port_binding(5000).await?;
//!     println!("reachable at {binding}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Dialing a peer
//!
//! ```rust,no_run
//! use quicmesh_core::transport::quic::QuicTransport;
//! use quicmesh_core::transport::Transport;
//!
//! # #[tokio::main]
//! # async fn main() -> std::io::Result<()> {
//! let transport = QuicTransport::bind("0.0.0.0:5000".parse().unwrap(), false)?;
//! let connection = transport.dial("10.0.0.2:5000".parse().unwrap()).await?;
//! connection.send_bytes(&[0x45, 0, 0, 20]).await?;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod nat;
pub mod socket;
pub mod stun;
pub mod transport;
