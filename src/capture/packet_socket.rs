//! Linux `AF_PACKET` raw socket bound to one interface and ethertype.

use std::io;
use std::mem::{self, MaybeUninit};
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use tracing::debug;

use super::filter::BpfInsn;
use super::RawHandle;
use crate::domain::{FrameFlags, InterfaceSnapshot, Protocol};
use crate::error::CaptureError;

/// `sll_pkttype` values from `<linux/if_packet.h>`
const PACKET_BROADCAST: u8 = 1;
const PACKET_OUTGOING: u8 = 4;

/// A non-blocking packet socket with a BPF filter attached.
#[derive(Debug)]
pub struct PacketSocket {
    socket: Socket,
    ifindex: u32,
    ethertype: u16,
    flags: FrameFlags,
}

impl PacketSocket {
    /// Open a packet socket for `protocol` on `ifp`.
    ///
    /// The filter is attached before the socket is bound so no unfiltered
    /// frame is ever queued.
    pub fn open(
        ifp: &InterfaceSnapshot,
        protocol: Protocol,
        addr: Option<Ipv4Addr>,
    ) -> Result<Self, CaptureError> {
        let info = protocol.info();
        let proto_be = info.ethertype.to_be();

        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW.nonblocking().cloexec(),
            Some(SockProtocol::from(libc::c_int::from(proto_be))),
        )
        .map_err(CaptureError::Open)?;

        let mut socket = Self {
            socket,
            ifindex: ifp.index,
            ethertype: info.ethertype,
            flags: FrameFlags::empty(),
        };
        socket
            .set_filter(&(info.filter)(addr))
            .map_err(CaptureError::Filter)?;
        socket
            .socket
            .bind(&link_addr(ifp.index, proto_be))
            .map_err(|source| CaptureError::Bind {
                index: ifp.index,
                source,
            })?;

        debug!(
            "Opened {} packet socket on {} (ethertype {:#06x})",
            info.name, ifp.name, info.ethertype
        );
        Ok(socket)
    }

    /// Replace the attached filter.
    pub fn set_filter(&mut self, prog: &[BpfInsn]) -> io::Result<()> {
        let insns: Vec<libc::sock_filter> = prog
            .iter()
            .map(|i| libc::sock_filter {
                code: i.code,
                jt: i.jt,
                jf: i.jf,
                k: i.k,
            })
            .collect();
        self.socket.attach_filter(&insns)
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn ethertype(&self) -> u16 {
        self.ethertype
    }

    /// Whether another frame is already queued.
    fn pending(&self) -> bool {
        let mut byte = [MaybeUninit::<u8>::uninit(); 1];
        self.socket.peek(&mut byte).is_ok()
    }
}

/// Link-layer address selecting `ifindex` and an ethertype in network order.
fn link_addr(ifindex: u32, proto_be: u16) -> SockAddr {
    // SAFETY: all-zero is a valid sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    // SAFETY: sockaddr_storage is large and aligned enough for any sockaddr.
    let sll = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll) };
    sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
    sll.sll_protocol = proto_be;
    sll.sll_ifindex = ifindex as libc::c_int;
    // SAFETY: storage holds an initialised sockaddr_ll of the given length.
    unsafe { SockAddr::new(storage, mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t) }
}

/// `sll_pkttype` of a link-layer source address.
fn packet_type(addr: &SockAddr) -> Option<u8> {
    if addr.family() != libc::AF_PACKET as libc::sa_family_t {
        return None;
    }
    // SAFETY: the family says the storage holds a sockaddr_ll.
    let sll = unsafe { &*(addr.as_ptr() as *const libc::sockaddr_ll) };
    Some(sll.sll_pkttype)
}

impl RawHandle for PacketSocket {
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: recv_from only writes initialised bytes into the buffer.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        loop {
            let (n, from) = match self.socket.recv_from(uninit) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.flags.insert(FrameFlags::EOF);
                    return Ok(0);
                }
                Err(e) => return Err(e),
            };
            let pkttype = packet_type(&from);

            // Our own transmissions loop back on packet sockets.
            if pkttype == Some(PACKET_OUTGOING) {
                if !self.pending() {
                    self.flags.insert(FrameFlags::EOF);
                    return Ok(0);
                }
                continue;
            }

            self.flags
                .set(FrameFlags::BCAST, pkttype == Some(PACKET_BROADCAST));
            if !self.pending() {
                self.flags.insert(FrameFlags::EOF);
            }
            return Ok(n);
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.socket.send(frame)
    }

    fn flags(&self) -> FrameFlags {
        self.flags
    }

    fn flags_mut(&mut self) -> &mut FrameFlags {
        &mut self.flags
    }
}

impl AsRawFd for PacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_addr_layout() {
        let addr = link_addr(7, 0x0806u16.to_be());
        assert_eq!(addr.family(), libc::AF_PACKET as libc::sa_family_t);
        assert_eq!(addr.len() as usize, mem::size_of::<libc::sockaddr_ll>());

        let sll = unsafe { &*(addr.as_ptr() as *const libc::sockaddr_ll) };
        assert_eq!(sll.sll_ifindex, 7);
        assert_eq!(u16::from_be(sll.sll_protocol), 0x0806);
        assert_eq!(packet_type(&addr), Some(0));
    }

    #[test]
    fn test_packet_type_needs_link_address() {
        let inet: SockAddr = std::net::SocketAddr::from((Ipv4Addr::LOCALHOST, 68)).into();
        assert_eq!(packet_type(&inet), None);
    }

    #[test]
    fn test_open_unknown_interface_fails() {
        let ifp = InterfaceSnapshot::new("nope0", 999_999, macaddr::MacAddr6::nil());
        // Without CAP_NET_RAW the socket cannot be created, with it the bind fails.
        assert!(matches!(
            PacketSocket::open(&ifp, Protocol::Bootp, None),
            Err(CaptureError::Open(_) | CaptureError::Bind { index: 999_999, .. })
        ));
    }
}
