use crate::registry::ConnectionRegistry;
use async_shutdown::ShutdownManager;
use async_trait::async_trait;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use quicmesh_core::device::DeviceRef;
use quicmesh_core::transport::{PacketContext, PacketHandler};
use serde::Serialize;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Destination address of a raw IP packet, `None` for anything that is not a
/// complete IPv4 or IPv6 header.
pub fn destination_addr(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => Ipv4Packet::new(packet).map(|p| IpAddr::V4(p.get_destination())),
        6 => Ipv6Packet::new(packet).map(|p| IpAddr::V6(p.get_destination())),
        _ => None,
    }
}

#[derive(Default, Debug)]
pub struct RouterStats {
    forwarded: AtomicU64,
    dropped_no_route: AtomicU64,
    dropped_malformed: AtomicU64,
    send_errors: AtomicU64,
    received: AtomicU64,
    device_write_errors: AtomicU64,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub forwarded: u64,
    pub dropped_no_route: u64,
    pub dropped_malformed: u64,
    pub send_errors: u64,
    pub received: u64,
    pub device_write_errors: u64,
}

impl RouterStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped_no_route: self.dropped_no_route.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            device_write_errors: self.device_write_errors.load(Ordering::Relaxed),
        }
    }
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Forwarded,
    NoRoute(IpAddr),
    Malformed,
    SendFailed,
}

/// Outbound half: device packets to the client owning their destination.
#[derive(Clone)]
pub struct PacketRouter {
    registry: ConnectionRegistry,
    stats: Arc<RouterStats>,
}

impl PacketRouter {
    pub fn new(registry: ConnectionRegistry, stats: Arc<RouterStats>) -> Self {
        Self { registry, stats }
    }

    /// Forward one packet, unchanged. Nothing is queued: a packet without a
    /// registered destination is dropped.
    pub async fn dispatch(&self, packet: &[u8]) -> Dispatch {
        let Some(dst) = destination_addr(packet) else {
            RouterStats::incr(&self.stats.dropped_malformed);
            log::debug!("drop malformed packet, len={}", packet.len());
            return Dispatch::Malformed;
        };
        let Some(client) = self.registry.client_for(&dst) else {
            RouterStats::incr(&self.stats.dropped_no_route);
            log::debug!("no peer route for {dst}, drop");
            return Dispatch::NoRoute(dst);
        };
        match client.send_bytes(packet).await {
            Ok(()) => {
                RouterStats::incr(&self.stats.forwarded);
                Dispatch::Forwarded
            }
            Err(e) => {
                RouterStats::incr(&self.stats.send_errors);
                log::warn!("send to {} failed: {e:?}", client.peer());
                Dispatch::SendFailed
            }
        }
    }

    /// Read the device until it fails. A read failure shuts the whole mesh down.
    pub async fn run(self, device: DeviceRef, mtu: usize, shutdown_manager: ShutdownManager<()>) {
        let mut buf = vec![0u8; mtu];
        loop {
            let len = match device.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    if shutdown_manager.is_shutdown_triggered() {
                        log::debug!("device read stopped during shutdown: {e:?}");
                    } else {
                        log::error!("device read failed, shutting down: {e:?}");
                        _ = shutdown_manager.trigger_shutdown(());
                    }
                    return;
                }
            };
            if len == 0 {
                continue;
            }
            self.dispatch(&buf[..len]).await;
        }
    }
}

/// Inbound half: writes every received payload verbatim into the device.
pub struct DeviceWriter {
    stats: Arc<RouterStats>,
}

impl DeviceWriter {
    pub fn new(stats: Arc<RouterStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl PacketHandler for DeviceWriter {
    async fn handle(&self, ctx: PacketContext) -> io::Result<()> {
        RouterStats::incr(&self.stats.received);
        if let Err(e) = ctx.write_to_device().await {
            RouterStats::incr(&self.stats.device_write_errors);
            return Err(e);
        }
        Ok(())
    }
}
