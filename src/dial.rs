use crate::config::{DialPolicy, Peer};
use crate::context::MeshContext;
use crate::error::{Error, Result};
use quicmesh_core::transport::{ConnectionRef, TransportRef};
use serde::Serialize;
use std::io;

/// Dial progress of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DialState {
    #[default]
    Idle,
    Dialing,
    Connected,
    /// Retry budget spent without a session.
    Exhausted,
    /// Was connected, the session has since been lost.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    /// Registered; `reused` when no new session was opened for it.
    Connected { reused: bool, attempts: usize },
    /// The peer already had a client or another task is dialing it.
    Skipped,
}

pub(crate) struct DialTask {
    ctx: MeshContext,
    transport: TransportRef,
    peer: Peer,
    policy: DialPolicy,
}

impl DialTask {
    pub(crate) fn new(
        ctx: MeshContext,
        transport: TransportRef,
        peer: Peer,
        policy: DialPolicy,
    ) -> Self {
        Self {
            ctx,
            transport,
            peer,
            policy,
        }
    }

    /// Drive the peer to `Connected` or `Exhausted`.
    ///
    /// Each attempt reuses the host's connection when one exists; otherwise it
    /// dials. Failures wait `retry_interval` before the next attempt, never
    /// after the last one.
    pub(crate) async fn run(self) -> Result<DialOutcome> {
        let registry = &self.ctx.registry;
        let key = self.peer.canonical_address();
        if !registry.begin_dial(key) {
            return Ok(DialOutcome::Skipped);
        }
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            if let Some(existing) = registry.connection(self.peer.host()) {
                if let Some(registration) = registry.register_existing(&self.peer, &existing) {
                    log::info!(
                        "peer {} connected over existing session {}",
                        self.peer,
                        registration.client.connection().stable_id()
                    );
                    return Ok(DialOutcome::Connected {
                        reused: true,
                        attempts,
                    });
                }
                log::debug!(
                    "session {} to {} went away before {} could use it",
                    existing.stable_id(),
                    self.peer.host(),
                    self.peer
                );
            }
            attempts += 1;
            match self.dial_once().await {
                Ok(connection) => {
                    let registration = registry.register(&self.peer, connection);
                    if let Some(loser) = registration.superseded {
                        log::debug!(
                            "session {} to {} lost the race, closing",
                            loser.stable_id(),
                            self.peer.host()
                        );
                        loser.close();
                    }
                    if registration.connection_inserted {
                        self.ctx.attach_connection(
                            self.peer.host().to_string(),
                            registration.client.connection().clone(),
                        );
                    }
                    log::info!("peer {} connected after {attempts} attempt(s)", self.peer);
                    return Ok(DialOutcome::Connected {
                        reused: !registration.connection_inserted,
                        attempts,
                    });
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        registry.set_state(key, DialState::Exhausted);
                        return Err(Error::PeerUnreachable {
                            endpoint: self.peer.endpoint().to_string(),
                            key,
                            attempts,
                        });
                    }
                    log::warn!(
                        "dial {} attempt {attempts}/{max_attempts} failed: {e}, retry in {:?}",
                        self.peer,
                        self.policy.retry_interval()
                    );
                    tokio::time::sleep(self.policy.retry_interval()).await;
                }
            }
        }
    }

    async fn dial_once(&self) -> io::Result<ConnectionRef> {
        let remote = self.peer.resolve().await?;
        self.transport.dial(remote).await
    }
}
