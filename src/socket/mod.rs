/*!
    This module provide the trait [EthercatSocket], and several implementors allowing to use different physical layers for ethercat communication.

    - UDP socket allows to run multiple master, one ethercat segment each, on the same ethernet network (and same machine ethernet port). But exposes the ethercat network to possible delays due to ethernet packet collisions.
    - Raw socket allows one only master with one only ethercat segment on the ethernet network. It ensure no communication delay with an ethercat segment.
    - Simulated segment emulates slaves in memory, for tests and offline runs.

    | socket type |  allowed masters on network  |  allowed EC segments on network |  possible jitter |  other protocols allowed on same network |
    |-------------|----------------------------------------|-------------------------------------------|------------------|------------------------------------------|
    | [EthernetSocket] | 1                                 | 1                                         | none             | all non-ethercat protocols               |
    | [UdpSocket] | 2^32                                    | 2^32                                       | depend on trafic | all                                      |
*/

mod udp;
#[cfg(target_os = "linux")]
mod ethernet;
mod simulated;

pub use udp::UdpSocket;
#[cfg(target_os = "linux")]
pub use ethernet::EthernetSocket;
pub use simulated::{SimulatedSegment, SimulatedSlave};

use core::task::{Poll, Context};
use std::{io, net::Ipv4Addr, sync::Arc};
use crate::error::{EthercatError, EthercatResult};

/**
    trait implementing the ethercat frame encapsulation into some medium

    This allows to send or receive ethercat frames over any network, but according to ETG 1000.4, only Ethernet and UDP are officially supported
*/
pub trait EthercatSocket {
    /**
        receive an ethercat frame into the given buffer (starting from ethercat header)

        The buffer should be big enough for the data to receive. Returns the number of bytes read.

        The implementor is responsible from assembling the whole packet, and hiding the details of socket-specific headers, footers, checks, fragmentation ...
    */
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>>;

    /**
        send an ethercat frame contained in the given buffer.

        The whole buffer will be sent, the user has to tail it to the exact data size to send.

        the buffer passed must contain the data with the ethercat header.
        The implentor of this trait is responsible of encapsulating the data into the specific socket by adding the necessary specific headers, footers, checks, fragmentation ...
    */
    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>>;

    /// maximum frame size tolerated for sending by this socket
    fn max_frame(&self) -> usize;
}

/**
    open the socket designated by a link name

    - `udp:<ipv4>` opens a [UdpSocket] toward the given segment address
    - `sim` or `sim:<n>` creates a [SimulatedSegment] of `n` generic slaves (1 by default)
    - anything else is taken as the name of a network interface, opened with an [EthernetSocket]

    This must be called from a tokio runtime.
*/
pub fn open(link: &str) -> EthercatResult<Box<dyn EthercatSocket + Send + Sync>> {
    let failed = |reason: io::Error| EthercatError::Connection {
        link: link.to_owned(),
        reason: Arc::new(reason),
        };
    if let Some(address) = link.strip_prefix("udp:") {
        let address: Ipv4Addr = address.parse()
            .map_err(|_| failed(io::Error::new(io::ErrorKind::InvalidInput, "invalid ipv4 address")))?;
        Ok(Box::new(UdpSocket::new(address).map_err(failed)?))
    }
    else if link == "sim" || link.starts_with("sim:") {
        let slaves = match link.strip_prefix("sim:") {
            Some(count) => count.parse()
                .map_err(|_| failed(io::Error::new(io::ErrorKind::InvalidInput, "invalid number of simulated slaves")))?,
            None => 1,
        };
        Ok(Box::new(SimulatedSegment::generic(slaves)))
    }
    else {
        open_interface(link).map_err(failed)
    }
}

#[cfg(target_os = "linux")]
fn open_interface(interface: &str) -> io::Result<Box<dyn EthercatSocket + Send + Sync>> {
    Ok(Box::new(EthernetSocket::new(interface)?))
}
#[cfg(not(target_os = "linux"))]
fn open_interface(_interface: &str) -> io::Result<Box<dyn EthercatSocket + Send + Sync>> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "raw ethernet sockets are only available on linux"))
}
