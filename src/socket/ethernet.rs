use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use core::task::{Poll, Context, ready};
use packed_struct::prelude::*;
use tokio::io::unix::AsyncFd;
use log::debug;
use super::EthercatSocket;

/// ethernet type: ethercat
const ETHERCAT_TYPE: u16 = 0x88a4;
/// the master's source address, slaves only flip one bit of it when forwarding
const MASTER_MAC: [u8; 6] = [0x12, 0x10, 0x10, 0x10, 0x10, 0x10];
const BROADCAST_MAC: [u8; 6] = [0xff; 6];
/// maximum ethernet frame size without FCS, which is handled by the network card
const MAX_ETHERNET_FRAME: usize = 1514;
/// minimum ethernet frame size without FCS
const MIN_ETHERNET_FRAME: usize = 60;
const HEADER_SIZE: usize = 14;


/**
    Raw socket allowing direct ethercat com, but only one segment on the ethernet network

    Raw sockets are not implemented in std::net, so here is an implementation found in `smoltcp` and `ethercrab`, registered non-blocking in the tokio reactor.
    This implementation is linux-specific
*/
#[derive(Debug)]
pub struct EthernetSocket {
    lower: AsyncFd<OwnedFd>,
}

impl EthernetSocket {
    /// open the given network interface, this needs the `CAP_NET_RAW` capability
    ///
    /// must be called from a tokio runtime
    pub fn new(interface: &str) -> io::Result<Self> {
        if interface.len() >= libc::IF_NAMESIZE || interface.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid interface name"));
        }

        // create
        let lower = unsafe {
            let lower = libc::socket(
                // Ethernet II frames
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                ETHERCAT_TYPE.to_be() as i32,
            );
            if lower == -1 {
                return Err(io::Error::last_os_error());
            }
            // closed on drop, including on the error paths below
            OwnedFd::from_raw_fd(lower)
        };

        // bind
        let mut ifreq = ifreq_for(interface);
        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: ETHERCAT_TYPE.to_be(),
            sll_ifindex: ifreq_ioctl(lower.as_raw_fd(), &mut ifreq, libc::SIOCGIFINDEX)?,
            sll_hatype: 1,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };
        unsafe {
            let res = libc::bind(
                lower.as_raw_fd(),
                &sockaddr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            );
            if res == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        // the registered descriptor is owned by the AsyncFd and stays open until it drops
        let lower = unsafe {AsyncFd::register(lower)?};
        Ok(Self {lower})
    }

    /// read one ethernet frame, returning its size and whether it was emitted by this host
    fn read(lower: &OwnedFd, packed: &mut [u8]) -> io::Result<(usize, bool)> {
        let mut source: libc::sockaddr_ll = unsafe {std::mem::zeroed()};
        let mut source_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        let len = unsafe {
            libc::recvfrom(
                lower.as_raw_fd(),
                packed.as_mut_ptr() as *mut libc::c_void,
                packed.len(),
                0,
                &mut source as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut source_len,
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((len as usize, source.sll_pkttype == libc::PACKET_OUTGOING))
    }
}

impl EthercatSocket for EthernetSocket {
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut packed = [0u8; MAX_ETHERNET_FRAME];
        loop {
            let mut guard = ready!(self.lower.poll_read_ready(cx))?;
            let (len, outgoing) = match guard.try_io(|lower| Self::read(lower.get_ref(), &mut packed)) {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            if outgoing || len < HEADER_SIZE {
                continue
            }
            let header = EthernetHeader::unpack_from_slice(&packed[.. HEADER_SIZE])
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed ethernet header"))?;
            if header.ty != ETHERCAT_TYPE {
                debug!("ignoring ethernet frame of type {:#06x}", header.ty);
                continue
            }
            let content = &packed[HEADER_SIZE .. len];
            let size = content.len().min(data.len());
            data[.. size].copy_from_slice(&content[.. size]);
            return Poll::Ready(Ok(size))
        }
    }
    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        let mut packed = heapless::Vec::<u8, MAX_ETHERNET_FRAME>::new();
        let header = EthernetHeader {
            dst: BROADCAST_MAC,
            src: MASTER_MAC,
            // vlan is said to be optional and this is not present in most ethercat frames, so will not be used here
            ty: ETHERCAT_TYPE,
            }.pack()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "cannot pack ethernet header"))?;
        let overflow = || io::Error::new(io::ErrorKind::InvalidInput, "ethercat frame too big for ethernet");
        packed.extend_from_slice(&header).map_err(|_| overflow())?;
        packed.extend_from_slice(data).map_err(|_| overflow())?;
        if packed.len() < MIN_ETHERNET_FRAME {
            packed.resize(MIN_ETHERNET_FRAME, 0).map_err(|_| overflow())?;
        }

        loop {
            let mut guard = ready!(self.lower.poll_write_ready(cx))?;
            let written = guard.try_io(|lower| {
                let len = unsafe {
                    libc::write(
                        lower.get_ref().as_raw_fd(),
                        packed.as_ptr() as *const libc::c_void,
                        packed.len(),
                    )
                };
                if len < 0 {Err(io::Error::last_os_error())}
                else {Ok(len as usize)}
            });
            match written {
                Ok(Ok(len)) if len == packed.len() => return Poll::Ready(Ok(())),
                Ok(Ok(_)) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::WriteZero, "ethernet frame partially sent"))),
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
    fn max_frame(&self) -> usize {
        MAX_ETHERNET_FRAME - HEADER_SIZE
    }
}


// intermediate C-like structures and functions

#[repr(C)]
#[derive(Debug)]
struct ifreq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_data: libc::c_int, /* ifr_ifindex or ifr_mtu */
}

fn ifreq_ioctl(
    lower: libc::c_int,
    ifreq: &mut ifreq,
    cmd: libc::c_ulong,
) -> io::Result<libc::c_int> {
    unsafe {
        let res = libc::ioctl(lower, cmd, ifreq as *mut ifreq);
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(ifreq.ifr_data)
}

fn ifreq_for(name: &str) -> ifreq {
    let mut ifreq = ifreq {
        ifr_name: [0; libc::IF_NAMESIZE],
        ifr_data: 0,
    };
    for (i, byte) in name.as_bytes().iter().enumerate() {
        ifreq.ifr_name[i] = *byte as libc::c_char
    }
    ifreq
}


#[derive(PackedStruct, Clone, Debug)]
#[packed_struct(size_bytes="14", bit_numbering = "msb0", endian = "msb")]
struct EthernetHeader {
    #[packed_field(bytes="0:5")]  dst: [u8;6],
    #[packed_field(bytes="6:11")]  src: [u8;6],
    #[packed_field(bytes="12:13")]  ty: u16,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let packed = EthernetHeader {
            dst: BROADCAST_MAC,
            src: MASTER_MAC,
            ty: ETHERCAT_TYPE,
            }.pack().unwrap();
        assert_eq!(&packed[.. 6], &[0xff; 6]);
        assert_eq!(&packed[6 .. 12], &MASTER_MAC);
        assert_eq!(&packed[12 ..], &[0x88, 0xa4]);
    }

    #[test]
    fn interface_name() {
        // refused before any descriptor is opened, so no runtime nor capability is needed
        for name in ["", "an_interface_name_too_long"] {
            let err = EthernetSocket::new(name).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
    }
}
