use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};

use log::info;

use crate::error::TransportError;

/// Largest datagram read from either socket.
pub const RX_BUF_SIZE: usize = 1500;

/// A non-blocking datagram socket.
pub trait DatagramSocket {
    fn send_to(&mut self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// `Ok(None)` when nothing is waiting.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&mut self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, dest)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match UdpSocket::recv_from(self, buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            // Windows reports ICMP port unreachable from an earlier send here.
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, TransportError> {
    let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| TransportError::Bind { addr, source })?;
    info!("bound UDP {}", addr);
    Ok(socket)
}
