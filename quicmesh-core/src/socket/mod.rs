use socket2::Protocol;
use std::io;
use std::net::SocketAddr;

/// Bind a non-blocking UDP socket.
///
/// With `reuse` set the address (and, on unix, the port) may be shared, so a
/// short-lived STUN query socket and the QUIC endpoint can sit on the same listen port.
pub fn bind_udp(addr: SocketAddr, reuse: bool) -> io::Result<std::net::UdpSocket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_only_v6(false)?;
        socket
    };
    if reuse && addr.port() != 0 {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        if let Err(e) = socket.set_reuse_port(true) {
            log::warn!("set_reuse_port {e:?}")
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Bind an async UDP socket on the tokio runtime.
pub fn bind_tokio_udp(addr: SocketAddr, reuse: bool) -> io::Result<tokio::net::UdpSocket> {
    tokio::net::UdpSocket::from_std(bind_udp(addr, reuse)?)
}
