//! Protocol tags and command codes.

use std::fmt;
use std::net::Ipv4Addr;

use crate::capture::filter::{self, BpfInsn};
use crate::error::ProtocolError;

/// Ethertype carried by BOOTP/DHCP frames.
pub const ETHERTYPE_IP: u16 = 0x0800;
/// Ethertype carried by ARP frames.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Builds the capture filter for a worker, optionally narrowed to one address.
pub type FilterFn = fn(Option<Ipv4Addr>) -> Vec<BpfInsn>;

/// Protocols a capture worker can be started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Bootp,
    Arp,
}

/// Static description of a protocol: what a worker for it captures.
#[derive(Debug)]
pub struct ProtocolInfo {
    pub protocol: Protocol,
    /// Command tag on the wire (without START/STOP bits)
    pub tag: u16,
    pub ethertype: u16,
    /// Human readable name, used in process titles and logs
    pub name: &'static str,
    pub filter: FilterFn,
}

static PROTOCOLS: [ProtocolInfo; 2] = [
    ProtocolInfo {
        protocol: Protocol::Bootp,
        tag: 0x0101,
        ethertype: ETHERTYPE_IP,
        name: "BOOTP",
        filter: filter::bootp_filter,
    },
    ProtocolInfo {
        protocol: Protocol::Arp,
        tag: 0x0102,
        ethertype: ETHERTYPE_ARP,
        name: "ARP",
        filter: filter::arp_filter,
    },
];

impl Protocol {
    pub fn info(self) -> &'static ProtocolInfo {
        match self {
            Protocol::Bootp => &PROTOCOLS[0],
            Protocol::Arp => &PROTOCOLS[1],
        }
    }

    /// Look up a protocol by its wire tag.
    pub fn from_tag(tag: u16) -> Option<Self> {
        PROTOCOLS.iter().find(|p| p.tag == tag).map(|p| p.protocol)
    }

    /// The byte stored in a routing key for this protocol.
    pub fn key_byte(self) -> u8 {
        (self.info().tag & 0xff) as u8
    }

    /// Look up a protocol by the byte stored in a routing key.
    pub fn from_key_byte(byte: u8) -> Option<Self> {
        PROTOCOLS
            .iter()
            .find(|p| (p.tag & 0xff) as u8 == byte)
            .map(|p| p.protocol)
    }

    pub fn command(self) -> CommandCode {
        CommandCode(self.info().tag)
    }

    pub fn start(self) -> CommandCode {
        CommandCode(self.info().tag | CommandCode::START)
    }

    pub fn stop(self) -> CommandCode {
        CommandCode(self.info().tag | CommandCode::STOP)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.info().name)
    }
}

/// A command code as carried in a message header: a protocol tag
/// combined with the START/STOP modifier bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandCode(pub u16);

impl CommandCode {
    pub const START: u16 = 0x4000;
    pub const STOP: u16 = 0x8000;

    /// The code with the modifier bits masked off.
    pub fn tag(self) -> u16 {
        self.0 & !(Self::START | Self::STOP)
    }

    pub fn protocol(self) -> Result<Protocol, ProtocolError> {
        Protocol::from_tag(self.tag()).ok_or(ProtocolError::Unsupported(self.0))
    }

    pub fn is_start(self) -> bool {
        self.0 & Self::START != 0
    }

    pub fn is_stop(self) -> bool {
        self.0 & Self::STOP != 0
    }

    /// A plain frame command: neither START nor STOP.
    pub fn is_frame(self) -> bool {
        !self.is_start() && !self.is_stop()
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
