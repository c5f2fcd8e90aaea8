use quicmesh_core::nat::{NatDiscovery, NatType};
use serde::Serialize;
use std::net::SocketAddr;

/// Whether this node may accept inbound sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NatGate {
    /// Cone NAT (or no NAT). `binding` is the externally observed listen address.
    Open { binding: Option<SocketAddr> },
    /// Classification was switched off in the config.
    Skipped,
    /// Server mode disabled by the operator.
    Disabled,
    Symmetric,
    /// Classification failed.
    Unavailable,
}

impl NatGate {
    /// Classify the NAT in front of `port`. Never fails: anything short of a
    /// cone classification closes the gate and leaves outbound dialing intact.
    pub async fn check(discovery: &dyn NatDiscovery, port: u16) -> NatGate {
        match discovery.classify(port).await {
            Ok(NatType::Symmetric) => {
                log::warn!("symmetric NAT detected, inbound sessions disabled, dialing only");
                NatGate::Symmetric
            }
            Ok(NatType::Cone) => {
                let binding = match discovery.port_binding(port).await {
                    Ok(addr) => {
                        log::info!("cone NAT, port {port} is reachable at {addr}");
                        Some(addr)
                    }
                    Err(e) => {
                        log::warn!("cone NAT, but port binding lookup failed: {e}");
                        None
                    }
                };
                NatGate::Open { binding }
            }
            Err(e) => {
                log::warn!("NAT classification failed, dialing only: {e}");
                NatGate::Unavailable
            }
        }
    }

    pub fn accepts_inbound(&self) -> bool {
        matches!(self, NatGate::Open { .. } | NatGate::Skipped)
    }

    pub fn binding(&self) -> Option<SocketAddr> {
        match self {
            NatGate::Open { binding } => *binding,
            _ => None,
        }
    }
}
