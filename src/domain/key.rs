//! Routing keys identifying one worker.

use std::fmt;
use std::net::Ipv4Addr;

use super::Protocol;

/// Identifies a worker: protocol, interface index and, for ARP, an address.
///
/// `proto` is kept as the raw key byte so that keys read off the wire
/// compare exactly as they were sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub proto: u8,
    pub ifindex: u32,
    pub addr: Option<Ipv4Addr>,
}

impl RoutingKey {
    pub fn new(protocol: Protocol, ifindex: u32, addr: Option<Ipv4Addr>) -> Self {
        Self {
            proto: protocol.key_byte(),
            ifindex,
            // 0.0.0.0 is how "no address" travels on the wire
            addr: addr.filter(|a| !a.is_unspecified()),
        }
    }

    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_key_byte(self.proto)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol() {
            Some(p) => write!(f, "{}", p)?,
            None => write!(f, "proto {:#04x}", self.proto)?,
        }
        write!(f, " ifindex {}", self.ifindex)?;
        if let Some(addr) = self.addr {
            write!(f, " {}", addr)?;
        }
        Ok(())
    }
}
