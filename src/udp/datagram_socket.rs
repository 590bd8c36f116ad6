use std::io;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use anyhow::Context;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

/// This is an abstraction for a non-blocking datagram socket, introduced to facilitate
///  replacing the I/O part for testing
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send {
    fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// `Ok(None)` if no datagram is available right now
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, datagram, to)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Create a non-blocking UDP socket bound to `addr`, with kernel buffers of `buffer_size` bytes
///  if the OS permits.
pub fn bind_udp_socket(addr: SocketAddr, buffer_size: usize) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    // some platforms cap buffer sizes or reject large values - that is worth a warning, not a failure
    if let Err(e) = socket.set_send_buffer_size(buffer_size) {
        warn!("could not set UDP send buffer size to {}: {}", buffer_size, e);
    }
    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        warn!("could not set UDP receive buffer size to {}: {}", buffer_size, e);
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())
        .with_context(|| format!("bind error: {}", addr))?;

    let socket: UdpSocket = socket.into();
    debug!("bound UDP socket to {:?}", socket.local_addr());
    Ok(socket)
}
