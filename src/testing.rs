//! In-memory doubles for the transport, NAT and device ports.

use crate::config::Peer;
use crate::context::MeshContext;
use crate::mesh::MeshBackend;
use crate::registry::ConnectionRegistry;
use crate::router::{DeviceWriter, RouterStats};
use async_shutdown::ShutdownManager;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use quicmesh_core::device::{DeviceConfig, DeviceRef, VirtualDevice};
use quicmesh_core::nat::{NatDiscovery, NatType};
use quicmesh_core::transport::{
    Connection, ConnectionRef, Handshake, PacketStream, Transport, TransportRef,
};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

pub(crate) fn peer(endpoint: &str, allowed_ips: &[&str]) -> Peer {
    let ips = allowed_ips.iter().map(|ip| ip.parse().unwrap()).collect();
    Peer::new(endpoint, ips).unwrap()
}

pub(crate) fn ipv4_packet(dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&[10, 1, 0, 1]);
    packet[16..20].copy_from_slice(&dst);
    packet[20..].copy_from_slice(payload);
    packet
}

pub(crate) fn ipv6_packet(dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 40 + payload.len()];
    packet[0] = 0x60;
    packet[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    packet[6] = 17;
    packet[7] = 64;
    packet[8..24].copy_from_slice(&"fd00::1".parse::<Ipv6Addr>().unwrap().octets());
    packet[24..40].copy_from_slice(&dst.octets());
    packet[40..].copy_from_slice(payload);
    packet
}

/// Poll `f` until it holds, failing the test after a few seconds.
pub(crate) async fn eventually<F: Fn() -> bool>(f: F) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub(crate) fn mesh_context() -> (MeshContext, Arc<MemoryDevice>) {
    let device = MemoryDevice::new_arc();
    let stats = Arc::new(RouterStats::default());
    let ctx = MeshContext::new(
        ConnectionRegistry::new(),
        device.clone(),
        Arc::new(DeviceWriter::new(stats)),
        ShutdownManager::new(),
    );
    (ctx, device)
}

pub(crate) struct MockConnection {
    id: usize,
    remote: SocketAddr,
    sent: Mutex<Vec<Vec<u8>>>,
    fail_sends: AtomicBool,
    closed: AtomicBool,
    close_notify: Notify,
    stream_tx: mpsc::UnboundedSender<Box<dyn PacketStream>>,
    stream_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Box<dyn PacketStream>>>,
}

impl MockConnection {
    pub(crate) fn new_arc(id: usize, remote: &str) -> Arc<Self> {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            remote: remote.parse().unwrap(),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            stream_tx,
            stream_rx: tokio::sync::Mutex::new(stream_rx),
        })
    }
    pub(crate) fn new_ref(id: usize, remote: &str) -> ConnectionRef {
        Self::new_arc(id, remote)
    }
    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }
    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
    /// Open an inbound stream as the remote side would; packets sent on the
    /// returned channel arrive in order.
    pub(crate) fn open_stream(&self) -> mpsc::UnboundedSender<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        _ = self.stream_tx.send(Box::new(MockStream { rx }));
        tx
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn stable_id(&self) -> usize {
        self.id
    }
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
    async fn send_bytes(&self, buf: &[u8]) -> io::Result<()> {
        if self.is_closed() || self.fail_sends.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock send failure"));
        }
        self.sent.lock().push(buf.to_vec());
        Ok(())
    }
    async fn accept_stream(&self) -> io::Result<Box<dyn PacketStream>> {
        let mut rx = self.stream_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream.ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionAborted)),
            _ = self.closed() => Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
        }
    }
    async fn closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl PacketStream for MockStream {
    async fn recv_packet(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

pub(crate) struct MockTransport {
    local: SocketAddr,
    failures: Mutex<HashMap<SocketAddr, usize>>,
    dials: AtomicUsize,
    next_id: AtomicUsize,
    dialed: Mutex<Vec<Arc<MockConnection>>>,
    dial_delay: Mutex<Duration>,
    closed: AtomicBool,
    incoming_tx: mpsc::UnboundedSender<Box<dyn Handshake>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Box<dyn Handshake>>>,
}

impl MockTransport {
    pub(crate) fn new_arc() -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local: "127.0.0.1:5000".parse().unwrap(),
            failures: Mutex::new(HashMap::new()),
            dials: AtomicUsize::new(0),
            next_id: AtomicUsize::new(100),
            dialed: Mutex::new(Vec::new()),
            dial_delay: Mutex::new(Duration::ZERO),
            closed: AtomicBool::new(false),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        })
    }
    /// Fail the next `count` dials to `addr`; `usize::MAX` fails forever.
    pub(crate) fn fail_next(&self, addr: SocketAddr, count: usize) {
        self.failures.lock().insert(addr, count);
    }
    /// Hold every dial for `delay` before it succeeds or fails.
    pub(crate) fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.lock() = delay;
    }
    pub(crate) fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
    pub(crate) fn dialed(&self) -> Vec<Arc<MockConnection>> {
        self.dialed.lock().clone()
    }
    /// Queue an inbound session whose handshake is already done.
    pub(crate) fn push_incoming(&self, connection: Arc<MockConnection>) {
        let remote = connection.remote_addr();
        let (tx, rx) = oneshot::channel();
        _ = tx.send(connection as ConnectionRef);
        _ = self.incoming_tx.send(Box::new(MockHandshake { remote, rx }));
    }
    /// Queue an inbound session that finishes its handshake once the returned
    /// sender fires; dropping the sender fails it.
    pub(crate) fn push_pending(&self, remote: &str) -> oneshot::Sender<ConnectionRef> {
        let (tx, rx) = oneshot::channel();
        _ = self.incoming_tx.send(Box::new(MockHandshake {
            remote: remote.parse().unwrap(),
            rx,
        }));
        tx
    }
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
    async fn dial(&self, remote: SocketAddr) -> io::Result<ConnectionRef> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let delay = *self.dial_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(&remote) {
                if *left > 0 {
                    if *left != usize::MAX {
                        *left -= 1;
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("mock dial {remote} refused"),
                    ));
                }
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = MockConnection::new_arc(id, &remote.to_string());
        self.dialed.lock().push(connection.clone());
        Ok(connection)
    }
    async fn accept(&self) -> Option<Box<dyn Handshake>> {
        let mut rx = self.incoming_rx.lock().await;
        rx.recv().await
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockHandshake {
    remote: SocketAddr,
    rx: oneshot::Receiver<ConnectionRef>,
}

#[async_trait]
impl Handshake for MockHandshake {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
    async fn complete(self: Box<Self>) -> io::Result<ConnectionRef> {
        self.rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "mock handshake abandoned"))
    }
}

pub(crate) struct MemoryDevice {
    inbound_tx: mpsc::UnboundedSender<io::Result<Vec<u8>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>,
    written: Mutex<Vec<Vec<u8>>>,
}

impl MemoryDevice {
    pub(crate) fn new_arc() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            written: Mutex::new(Vec::new()),
        })
    }
    /// Queue a packet for the next `recv`, as if the OS routed it into the device.
    pub(crate) fn inject(&self, packet: Vec<u8>) {
        _ = self.inbound_tx.send(Ok(packet));
    }
    pub(crate) fn fail_read(&self) {
        _ = self
            .inbound_tx
            .send(Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed")));
    }
    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl VirtualDevice for MemoryDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(Ok(packet)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            Some(Err(e)) => Err(e),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().push(buf.to_vec());
        Ok(buf.len())
    }
}

#[derive(Clone)]
pub(crate) struct MockNat {
    nat_type: Option<NatType>,
    binding: Option<SocketAddr>,
    delay: Duration,
}

impl MockNat {
    /// `None` for `nat_type` makes classification fail.
    pub(crate) fn new(nat_type: Option<NatType>, binding: Option<SocketAddr>) -> Self {
        Self {
            nat_type,
            binding,
            delay: Duration::ZERO,
        }
    }
    /// Hold every classification for `delay`, like a slow STUN server.
    pub(crate) fn set_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl NatDiscovery for MockNat {
    async fn classify(&self, _port: u16) -> io::Result<NatType> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.nat_type
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no stun answer"))
    }
    async fn port_binding(&self, _port: u16) -> io::Result<SocketAddr> {
        self.binding
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no stun answer"))
    }
}

pub(crate) struct MockBackend {
    pub(crate) device: Arc<MemoryDevice>,
    pub(crate) transport: Arc<MockTransport>,
    nat: MockNat,
    fail_device: bool,
    fail_transport: bool,
    accept_inbound: Mutex<Option<bool>>,
    devices_created: AtomicUsize,
    resolved: Mutex<Option<IpAddr>>,
}

impl MockBackend {
    pub(crate) fn new(nat: MockNat) -> Arc<Self> {
        Arc::new(Self::with_failures(nat, false, false))
    }
    pub(crate) fn with_failures(nat: MockNat, fail_device: bool, fail_transport: bool) -> Self {
        Self {
            device: MemoryDevice::new_arc(),
            transport: MockTransport::new_arc(),
            nat,
            fail_device,
            fail_transport,
            accept_inbound: Mutex::new(None),
            devices_created: AtomicUsize::new(0),
            resolved: Mutex::new(None),
        }
    }
    /// `accept_inbound` the transport was bound with, if it was bound.
    pub(crate) fn accept_inbound(&self) -> Option<bool> {
        *self.accept_inbound.lock()
    }
    pub(crate) fn devices_created(&self) -> usize {
        self.devices_created.load(Ordering::SeqCst)
    }
    pub(crate) fn bound_ip(&self) -> Option<IpAddr> {
        *self.resolved.lock()
    }
}

impl MeshBackend for MockBackend {
    fn create_device(&self, _config: &DeviceConfig) -> io::Result<DeviceRef> {
        self.devices_created.fetch_add(1, Ordering::SeqCst);
        if self.fail_device {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "no tun"));
        }
        Ok(self.device.clone())
    }
    fn create_transport(&self, addr: SocketAddr, accept_inbound: bool) -> io::Result<TransportRef> {
        if self.fail_transport {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        *self.accept_inbound.lock() = Some(accept_inbound);
        *self.resolved.lock() = Some(addr.ip());
        Ok(self.transport.clone())
    }
    fn nat_discovery(&self, _stun_servers: &[String]) -> Box<dyn NatDiscovery> {
        Box::new(self.nat.clone())
    }
}
