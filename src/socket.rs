use std::io;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

/// The datagram transport a connection runs on, introduced to facilitate mocking the I/O
///  part away for testing. All calls are non-blocking; the worker loop supplies the cadence.
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send + Sync + 'static {
    /// the largest datagram this socket accepts for sending
    fn max_send_size(&self) -> usize;

    fn is_read_open(&self) -> bool;

    fn is_write_open(&self) -> bool;

    /// Receives one pending datagram into `buf`, returning its length. `Ok(None)` when no
    ///  datagram is waiting.
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Hands one datagram to the OS. `Ok(false)` means the socket cannot take data right
    ///  now and the caller should back off and retry later.
    fn try_send(&self, datagram: &[u8]) -> io::Result<bool>;
}

/// A connected tokio UDP socket as the production transport.
pub struct ConnectedUdpSocket {
    socket: Arc<UdpSocket>,
    max_send_size: usize,
}

impl ConnectedUdpSocket {
    pub fn new(socket: Arc<UdpSocket>, max_send_size: usize) -> ConnectedUdpSocket {
        ConnectedUdpSocket { socket, max_send_size }
    }
}

impl DatagramSocket for ConnectedUdpSocket {
    fn max_send_size(&self) -> usize {
        self.max_send_size
    }

    fn is_read_open(&self) -> bool {
        true
    }

    fn is_write_open(&self) -> bool {
        true
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.try_recv(buf) {
            Ok(len) => Ok(Some(len)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn try_send(&self, datagram: &[u8]) -> io::Result<bool> {
        trace!("UDP socket: sending datagram of {} bytes", datagram.len());
        match self.socket.try_send(datagram) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}
