//! STUN binding queries on top of `stun-format`.
//!
//! Only what NAT classification needs: sending a binding request and
//! reading the mapped address out of the matching response.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use stun_format::{Attr, Msg, MsgBuilder, MsgType};
use tokio::net::UdpSocket;

pub const DEFAULT_STUN_PORT: u16 = 3478;

/// Transaction ids are 96 bits on the wire.
const TID_MASK: u128 = (1 << 96) - 1;

pub fn new_transaction_id() -> u128 {
    rand::random::<u128>() & TID_MASK
}

pub fn binding_request(tid: u128) -> io::Result<Vec<u8>> {
    let mut buf = [0u8; 28];
    let mut msg = MsgBuilder::from(buf.as_mut_slice());
    msg.typ(MsgType::BindingRequest)
        .ok_or_else(|| invalid("stun request buffer too small"))?;
    msg.tid(tid)
        .ok_or_else(|| invalid("stun request buffer too small"))?;
    Ok(msg.as_bytes().to_vec())
}

/// Read the mapped address from a binding response carrying `tid`.
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when both are present.
pub fn parse_binding_response(buf: &[u8], tid: u128) -> io::Result<SocketAddr> {
    let msg = Msg::from(buf);
    match msg.tid() {
        Some(got) if got == tid => {}
        Some(_) => return Err(invalid("transaction id mismatch")),
        None => return Err(invalid("stun response too short")),
    }
    let mut mapped = None;
    for attr in msg.attrs_iter() {
        match attr {
            Attr::XorMappedAddress(addr) => return Ok(socket_addr(addr)),
            Attr::MappedAddress(addr) => {
                if mapped.is_none() {
                    mapped = Some(socket_addr(addr));
                }
            }
            _ => {}
        }
    }
    mapped.ok_or_else(|| invalid("no mapped address in stun response"))
}

fn socket_addr(addr: stun_format::SocketAddr) -> SocketAddr {
    match addr {
        stun_format::SocketAddr::V4(ip, port) => SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port),
        stun_format::SocketAddr::V6(ip, port) => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port),
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Normalize a configured server name, appending the default STUN port.
pub fn normalize_server(server: &str) -> String {
    if server.contains(':') {
        server.to_string()
    } else {
        format!("{server}:{DEFAULT_STUN_PORT}")
    }
}

/// Send one binding request to `server` and wait for the matching response.
pub async fn query_mapped_addr(
    socket: &UdpSocket,
    server: &str,
    timeout: Duration,
) -> io::Result<SocketAddr> {
    let server_addr = tokio::net::lookup_host(normalize_server(server))
        .await?
        .find(|addr| addr.is_ipv4() == socket.local_addr().map(|a| a.is_ipv4()).unwrap_or(true))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{server} not resolved")))?;
    let tid = new_transaction_id();
    socket.send_to(&binding_request(tid)?, server_addr).await?;
    let mut buf = [0u8; 576];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("stun {server} timeout")))??;
        if from != server_addr {
            log::debug!("stun response from unexpected source {from}, expected {server_addr}");
            continue;
        }
        match parse_binding_response(&buf[..len], tid) {
            Ok(addr) => return Ok(addr),
            Err(e) => log::debug!("stun {server} {e:?}"),
        }
    }
}
