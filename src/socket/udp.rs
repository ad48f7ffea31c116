use std::io;
use std::net::{SocketAddr, IpAddr, Ipv4Addr};
use core::task::{Poll, Context, ready};
use tokio::io::ReadBuf;
use log::debug;
use super::EthercatSocket;

/// ethercat port, and ethertype in raw frames
const ETHERCAT_PORT: u16 = 0x88a4;

/**
    UDP socket with fixed port, allowing ethercat com through a regular switch
*/
pub struct UdpSocket {
    socket: tokio::net::UdpSocket,
    address: SocketAddr,

    filter_address: bool,
}

impl UdpSocket {
    /// according to ETG.1000.4 only IPv4 is supported, and port is fixed, hence this function only requires the host address
    ///
    /// must be called from a tokio runtime
    pub fn new(segment: Ipv4Addr) -> io::Result<Self> {
        let address = SocketAddr::new(IpAddr::V4(segment), ETHERCAT_PORT);
        let socket = std::net::UdpSocket::bind(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                ETHERCAT_PORT,
                ))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            address,
            socket: tokio::net::UdpSocket::from_std(socket)?,
            filter_address: true,
        })
    }
    /// whether frames coming from other hosts than the segment should be ignored, this is enabled by default
    pub fn set_filter_address(&mut self, enable: bool) {
        self.filter_address = enable;
    }
}

impl EthercatSocket for UdpSocket {
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            let mut buffer = ReadBuf::new(&mut *data);
            let source = ready!(self.socket.poll_recv_from(cx, &mut buffer))?;
            if self.filter_address && source != self.address {
                debug!("ignoring datagram from {}", source);
                continue
            }
            return Poll::Ready(Ok(buffer.filled().len()))
        }
    }
    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        let sent = ready!(self.socket.poll_send_to(cx, data, self.address))?;
        if sent != data.len() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::WriteZero, "ethercat frame partially sent")))
        }
        Poll::Ready(Ok(()))
    }
    fn max_frame(&self) -> usize {
        // header size is already taken by UDP
        1472
    }
}
