use crate::config::{MeshConfig, PeerDirectory};
use crate::context::MeshContext;
use crate::dial::{DialState, DialTask};
use crate::error::{Error, Result};
use crate::nat_gate::NatGate;
use crate::registry::ConnectionRegistry;
use crate::router::{DeviceWriter, PacketRouter, RouterStats, StatsSnapshot};
use crate::server;
use async_shutdown::ShutdownManager;
use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;
use quicmesh_core::device::{DeviceConfig, DeviceRef, TunDevice};
use quicmesh_core::nat::{NatDiscovery, StunNatDiscovery};
use quicmesh_core::transport::quic::QuicTransport;
use quicmesh_core::transport::TransportRef;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeshOptions {
    /// Do not dial configured peers.
    pub disable_client: bool,
    /// Do not accept inbound sessions.
    pub disable_server: bool,
}

impl MeshOptions {
    pub fn set_disable_client(mut self, disable_client: bool) -> Self {
        self.disable_client = disable_client;
        self
    }
    pub fn set_disable_server(mut self, disable_server: bool) -> Self {
        self.disable_server = disable_server;
        self
    }
}

/// Factory for the collaborators a mesh runs on.
pub trait MeshBackend: Send + Sync {
    fn create_device(&self, config: &DeviceConfig) -> io::Result<DeviceRef>;
    fn create_transport(&self, addr: SocketAddr, accept_inbound: bool) -> io::Result<TransportRef>;
    fn nat_discovery(&self, stun_servers: &[String]) -> Box<dyn NatDiscovery>;
}

/// TUN device, QUIC endpoint and STUN discovery.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBackend;

impl MeshBackend for SystemBackend {
    fn create_device(&self, config: &DeviceConfig) -> io::Result<DeviceRef> {
        Ok(Arc::new(TunDevice::create(config.clone())?))
    }
    fn create_transport(&self, addr: SocketAddr, accept_inbound: bool) -> io::Result<TransportRef> {
        Ok(Arc::new(QuicTransport::bind(addr, accept_inbound)?))
    }
    fn nat_discovery(&self, stun_servers: &[String]) -> Box<dyn NatDiscovery> {
        Box::new(StunNatDiscovery::new(stun_servers.to_vec()))
    }
}

struct Running {
    ctx: MeshContext,
    transport: TransportRef,
    gate: NatGate,
}

/// A mesh node: virtual device, NAT gate, server loop, one dial task per peer
/// and the packet router, all under one shutdown manager.
pub struct QuicMesh {
    config: MeshConfig,
    directory: PeerDirectory,
    options: MeshOptions,
    backend: Arc<dyn MeshBackend>,
    registry: ConnectionRegistry,
    shutdown_manager: ShutdownManager<()>,
    stats: Arc<RouterStats>,
    port_binding: AtomicCell<Option<SocketAddr>>,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl QuicMesh {
    pub fn new(config: MeshConfig) -> Result<Self> {
        Self::with_backend(config, Arc::new(SystemBackend))
    }

    pub fn with_backend(config: MeshConfig, backend: Arc<dyn MeshBackend>) -> Result<Self> {
        config.validate()?;
        let directory = config.peer_directory()?;
        Ok(Self {
            config,
            directory,
            options: MeshOptions::default(),
            backend,
            registry: ConnectionRegistry::new(),
            shutdown_manager: ShutdownManager::new(),
            stats: Arc::new(RouterStats::default()),
            port_binding: AtomicCell::new(None),
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }

    pub fn set_options(mut self, options: MeshOptions) -> Self {
        self.options = options;
        self
    }

    /// Bring the node up: device, NAT gate, transport and server, peer dials,
    /// then the outbound router.
    ///
    /// Fails only on device or transport errors. NAT and dial problems
    /// degrade the node and are logged.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown_manager.is_shutdown_triggered() {
            return Err(Error::Shutdown);
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }
        let rs = self.start_impl().await;
        if rs.is_err() {
            self.started.store(false, Ordering::Release);
        }
        rs
    }

    async fn start_impl(&self) -> Result<()> {
        let interface = &self.config.interface;
        let device = self
            .backend
            .create_device(&interface.device_config())
            .map_err(Error::Device)?;

        let gate = if self.options.disable_server {
            NatGate::Disabled
        } else if !self.config.nat_check {
            NatGate::Skipped
        } else {
            let discovery = self.backend.nat_discovery(&self.config.stun_servers);
            NatGate::check(discovery.as_ref(), interface.listen_port).await
        };
        if self.shutdown_manager.is_shutdown_triggered() {
            log::info!("shutdown during nat check, not binding {}", interface.listen_addr());
            return Err(Error::Shutdown);
        }
        self.port_binding.store(gate.binding());

        let transport = self
            .backend
            .create_transport(interface.listen_addr(), gate.accepts_inbound())
            .map_err(Error::Transport)?;
        if self.shutdown_manager.is_shutdown_triggered() {
            transport.close();
            return Err(Error::Shutdown);
        }

        let ctx = MeshContext::new(
            self.registry.clone(),
            device.clone(),
            Arc::new(DeviceWriter::new(self.stats.clone())),
            self.shutdown_manager.clone(),
        );

        if gate.accepts_inbound() {
            let (ready_tx, ready_rx) = oneshot::channel();
            ctx.spawn(
                "server",
                server::accept_loop(ctx.clone(), transport.clone(), ready_tx),
            );
            if ready_rx.await.is_err() {
                log::warn!("server task ended before it became ready");
            }
        }

        self.running.lock().replace(Running {
            ctx: ctx.clone(),
            transport,
            gate,
        });

        if !self.options.disable_client {
            self.connect_peers()?;
        }

        let router = PacketRouter::new(self.registry.clone(), self.stats.clone());
        ctx.spawn(
            "router",
            router.run(
                device,
                interface.mtu as usize,
                self.shutdown_manager.clone(),
            ),
        );
        log::info!(
            "mesh up on {} with {} peer(s), {:?}",
            interface.local_endpoint,
            self.directory.len(),
            gate
        );
        Ok(())
    }

    /// Spawn a dial task for every peer that has neither a client nor a dial
    /// in progress. Returns how many were spawned.
    pub fn connect_peers(&self) -> Result<usize> {
        let (ctx, transport) = {
            let guard = self.running.lock();
            let running = guard.as_ref().ok_or(Error::Shutdown)?;
            (running.ctx.clone(), running.transport.clone())
        };
        let mut spawned = 0;
        for peer in self.directory.iter() {
            let key = peer.canonical_address();
            if self.registry.contains_client(&key) || self.registry.state(&key) == DialState::Dialing {
                continue;
            }
            let task = DialTask::new(ctx.clone(), transport.clone(), peer.clone(), self.config.dial);
            let spawn = ctx.spawn("dial", async move {
                match task.run().await {
                    Ok(outcome) => log::debug!("dial finished: {outcome:?}"),
                    Err(e) => log::warn!("{e}"),
                }
            });
            if spawn {
                spawned += 1;
            }
        }
        Ok(spawned)
    }

    /// Resolves once shutdown has been triggered, by [`QuicMesh::shutdown`],
    /// a device read failure or [`QuicMesh::stop`].
    pub async fn wait(&self) {
        self.shutdown_manager.wait_shutdown_triggered().await;
    }

    /// Ask every task to stop without waiting for them.
    pub fn shutdown(&self) {
        _ = self.shutdown_manager.trigger_shutdown(());
    }

    /// Stop every task, close every session and the endpoint, then release
    /// the device. No mesh task runs once this returns.
    pub async fn stop(&self) {
        self.shutdown();
        let running = self.running.lock().take();
        for connection in self.registry.clear() {
            connection.close();
        }
        if let Some(running) = &running {
            running.transport.close();
        }
        self.shutdown_manager.wait_shutdown_complete().await;
        if let Some(running) = running {
            drop(running);
            log::info!("mesh stopped");
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Externally observed listen address, when the NAT gate found one.
    pub fn port_binding(&self) -> Option<SocketAddr> {
        self.port_binding.load()
    }

    pub fn nat_gate(&self) -> Option<NatGate> {
        self.running.lock().as_ref().map(|r| r.gate)
    }

    pub fn peer_state(&self, key: &IpAddr) -> DialState {
        self.registry.state(key)
    }

    pub fn peer_states(&self) -> Vec<(IpAddr, DialState)> {
        self.registry.states()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }
}

impl Drop for QuicMesh {
    fn drop(&mut self) {
        _ = self.shutdown_manager.trigger_shutdown(());
    }
}
