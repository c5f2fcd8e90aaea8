use crate::config::Peer;
use quicmesh_core::transport::ConnectionRef;
use std::io;
use std::net::IpAddr;

/// Handle bound to one peer, sending over the connection shared by its host.
pub struct Client {
    peer: Peer,
    connection: ConnectionRef,
}

impl Client {
    pub(crate) fn new(peer: Peer, connection: ConnectionRef) -> Self {
        Self { peer, connection }
    }
    pub fn peer(&self) -> &Peer {
        &self.peer
    }
    /// Canonical address the client is registered under.
    pub fn key(&self) -> IpAddr {
        self.peer.canonical_address()
    }
    pub fn connection(&self) -> &ConnectionRef {
        &self.connection
    }
    pub async fn send_bytes(&self, buf: &[u8]) -> io::Result<()> {
        self.connection.send_bytes(buf).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.peer.endpoint())
            .field("key", &self.key())
            .field("connection", &self.connection.stable_id())
            .finish()
    }
}
