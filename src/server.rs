use crate::context::MeshContext;
use quicmesh_core::transport::{Handshake, TransportRef};
use tokio::sync::oneshot;

/// Accept inbound sessions until the endpoint closes.
///
/// `ready` fires once the loop is about to accept; callers wait on that, never
/// on the loop finishing. Every handshake completes in its own task, so a peer
/// that stalls mid-handshake holds up nobody else. Each session is filed under
/// its remote host unless the host already has one, and is pumped into the
/// device either way.
pub(crate) async fn accept_loop(
    ctx: MeshContext,
    transport: TransportRef,
    ready: oneshot::Sender<()>,
) {
    match transport.local_addr() {
        Ok(addr) => log::info!("accepting inbound sessions on {addr}"),
        Err(e) => log::warn!("accepting inbound sessions, local address unknown: {e:?}"),
    }
    _ = ready.send(());
    while let Some(handshake) = transport.accept().await {
        let remote = handshake.remote_addr();
        log::debug!("inbound handshake from {remote}");
        if !ctx.spawn("handshake", complete_handshake(ctx.clone(), handshake)) {
            break;
        }
    }
    log::debug!("accept loop ended");
}

async fn complete_handshake(ctx: MeshContext, handshake: Box<dyn Handshake>) {
    let remote = handshake.remote_addr();
    let connection = match handshake.complete().await {
        Ok(connection) => connection,
        Err(e) => {
            log::warn!("inbound handshake from {remote} failed: {e}");
            return;
        }
    };
    let host = connection.remote_addr().ip().to_canonical().to_string();
    if ctx.registry.insert_connection_if_absent(&host, &connection) {
        log::info!(
            "accepted session {} from {}",
            connection.stable_id(),
            connection.remote_addr()
        );
    } else {
        log::debug!(
            "host {host} already has a session, {} is pumped but not registered",
            connection.stable_id()
        );
    }
    ctx.attach_connection(host, connection);
}
