//! Transport port.
//!
//! A [`Transport`] dials and accepts sessions; each session is a
//! [`Connection`] that sends whole packets and yields inbound
//! [`PacketStream`]s. Accepted sessions arrive as a [`Handshake`] so the
//! caller decides where the handshake is awaited. Received packets are delivered to a [`PacketHandler`]
//! wrapped in a [`PacketContext`].

use crate::device::DeviceRef;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

pub mod codec;
pub mod quic;

#[async_trait]
pub trait Connection: Send + Sync {
    /// Identifier that stays the same for the lifetime of the session.
    fn stable_id(&self) -> usize;
    fn remote_addr(&self) -> SocketAddr;
    /// Send one packet. Concurrent calls are serialized per packet.
    async fn send_bytes(&self, buf: &[u8]) -> io::Result<()>;
    /// Wait for the next stream the remote side opens.
    async fn accept_stream(&self) -> io::Result<Box<dyn PacketStream>>;
    /// Resolves once the session is gone, for whatever reason.
    async fn closed(&self);
    fn close(&self);
}

pub type ConnectionRef = Arc<dyn Connection>;

#[async_trait]
pub trait PacketStream: Send {
    /// Next packet, `None` once the remote side finished the stream.
    async fn recv_packet(&mut self) -> io::Result<Option<Bytes>>;
}

/// An inbound session whose handshake is still in flight.
#[async_trait]
pub trait Handshake: Send {
    fn remote_addr(&self) -> SocketAddr;
    /// Finish the handshake, failing after the transport's handshake timeout.
    async fn complete(self: Box<Self>) -> io::Result<ConnectionRef>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    async fn dial(&self, remote: SocketAddr) -> io::Result<ConnectionRef>;
    /// Next inbound session, `None` once the endpoint stops accepting.
    /// Returns as soon as a peer shows up, before its handshake completes.
    async fn accept(&self) -> Option<Box<dyn Handshake>>;
    fn close(&self);
}

pub type TransportRef = Arc<dyn Transport>;

/// One received packet together with where it came from and where it goes.
#[derive(Clone)]
pub struct PacketContext {
    pub device: DeviceRef,
    pub connection: ConnectionRef,
    pub data: Bytes,
}

impl PacketContext {
    pub fn new(device: DeviceRef, connection: ConnectionRef, data: Bytes) -> Self {
        Self {
            device,
            connection,
            data,
        }
    }
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }
    /// Write the payload, unchanged, into the local device.
    pub async fn write_to_device(&self) -> io::Result<usize> {
        self.device.send(&self.data).await
    }
}

#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, ctx: PacketContext) -> io::Result<()>;
}

pub type HandlerRef = Arc<dyn PacketHandler>;
