use crate::registry::ConnectionRegistry;
use async_shutdown::ShutdownManager;
use quicmesh_core::device::DeviceRef;
use quicmesh_core::transport::{ConnectionRef, HandlerRef, PacketContext, PacketStream};
use std::future::Future;

/// Everything a running mesh task needs, cheap to clone into each task.
#[derive(Clone)]
pub(crate) struct MeshContext {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) device: DeviceRef,
    pub(crate) handler: HandlerRef,
    pub(crate) shutdown_manager: ShutdownManager<()>,
}

impl MeshContext {
    pub(crate) fn new(
        registry: ConnectionRegistry,
        device: DeviceRef,
        handler: HandlerRef,
        shutdown_manager: ShutdownManager<()>,
    ) -> Self {
        Self {
            registry,
            device,
            handler,
            shutdown_manager,
        }
    }

    /// Spawn a task that is cancelled on shutdown and that shutdown completion waits for.
    pub(crate) fn spawn<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(token) = self.shutdown_manager.delay_shutdown_token() else {
            log::debug!("not spawning {name}: shutdown already completed");
            return false;
        };
        if self.shutdown_manager.is_shutdown_triggered() {
            log::debug!("not spawning {name}: shutdown triggered");
            return false;
        }
        let fut = self.shutdown_manager.wrap_cancel(fut);
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("recv shutdown signal: {name} task is shutdown");
            }
            drop(token);
        });
        true
    }

    /// Pump every inbound stream of `connection` into the packet handler.
    /// Once the session ends its registry entries are released.
    pub(crate) fn attach_connection(&self, host: String, connection: ConnectionRef) {
        let ctx = self.clone();
        self.spawn("inbound", async move {
            loop {
                tokio::select! {
                    rs = connection.accept_stream() => match rs {
                        Ok(stream) => ctx.pump_stream(connection.clone(), stream),
                        Err(e) => {
                            log::debug!("accept_stream {} {e:?}", connection.remote_addr());
                            break;
                        }
                    },
                    _ = connection.closed() => break,
                }
            }
            for key in ctx
                .registry
                .remove_connection(&host, connection.stable_id())
            {
                log::warn!("peer {key} disconnected, session to {host} lost");
            }
        });
    }

    fn pump_stream(&self, connection: ConnectionRef, mut stream: Box<dyn PacketStream>) {
        let ctx = self.clone();
        self.spawn("stream", async move {
            loop {
                match stream.recv_packet().await {
                    Ok(Some(data)) => {
                        let packet = PacketContext::new(ctx.device.clone(), connection.clone(), data);
                        if let Err(e) = ctx.handler.handle(packet).await {
                            log::debug!("inbound packet from {} {e:?}", connection.remote_addr());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("recv_packet {} {e:?}", connection.remote_addr());
                        break;
                    }
                }
            }
        });
    }
}
