//! Interface snapshots handed to workers at start.

use std::fmt;

use macaddr::MacAddr6;
use pnet::datalink::NetworkInterface;

use crate::error::ProtocolError;

/// Maximum interface name length, including the terminating NUL.
pub const IF_NAMESIZE: usize = 16;

/// Encoded size of an [`InterfaceSnapshot`].
pub const SNAPSHOT_LEN: usize = IF_NAMESIZE + 4 + 2 + 6;

/// ARPHRD_ETHER
pub const HWTYPE_ETHER: u16 = 1;

/// A copy of the interface a worker captures on.
///
/// Travels by value inside the START payload; the worker decodes its own
/// independent copy and nothing flows back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSnapshot {
    pub name: String,
    pub index: u32,
    pub hwtype: u16,
    pub hwaddr: MacAddr6,
}

impl InterfaceSnapshot {
    pub fn new(name: impl Into<String>, index: u32, hwaddr: MacAddr6) -> Self {
        Self {
            name: name.into(),
            index,
            hwtype: HWTYPE_ETHER,
            hwaddr,
        }
    }

    /// Encode as `[name: 16, NUL padded][index: u32 LE][hwtype: u16 LE][hwaddr: 6]`.
    ///
    /// Names longer than `IF_NAMESIZE - 1` bytes are cut, like the kernel does.
    pub fn encode(&self) -> [u8; SNAPSHOT_LEN] {
        let mut buf = [0u8; SNAPSHOT_LEN];
        let name = self.name.as_bytes();
        let len = name.len().min(IF_NAMESIZE - 1);
        buf[..len].copy_from_slice(&name[..len]);

        let mut off = IF_NAMESIZE;
        buf[off..off + 4].copy_from_slice(&self.index.to_le_bytes());
        off += 4;
        buf[off..off + 2].copy_from_slice(&self.hwtype.to_le_bytes());
        off += 2;
        buf[off..off + 6].copy_from_slice(self.hwaddr.as_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != SNAPSHOT_LEN {
            return Err(ProtocolError::PayloadLength {
                expected: SNAPSHOT_LEN,
                actual: data.len(),
            });
        }

        let raw_name = &data[..IF_NAMESIZE];
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(IF_NAMESIZE);
        if end == 0 || end == IF_NAMESIZE {
            return Err(ProtocolError::InvalidRequest(
                "interface name is empty or unterminated".to_string(),
            ));
        }
        let name = std::str::from_utf8(&raw_name[..end])
            .map_err(|_| ProtocolError::InvalidRequest("interface name is not UTF-8".to_string()))?
            .to_string();

        let mut off = IF_NAMESIZE;
        let index = u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        off += 4;
        let hwtype = u16::from_le_bytes([data[off], data[off + 1]]);
        off += 2;
        let hwaddr = MacAddr6::new(
            data[off],
            data[off + 1],
            data[off + 2],
            data[off + 3],
            data[off + 4],
            data[off + 5],
        );

        Ok(Self {
            name,
            index,
            hwtype,
            hwaddr,
        })
    }
}

impl From<&NetworkInterface> for InterfaceSnapshot {
    fn from(iface: &NetworkInterface) -> Self {
        match iface.mac {
            Some(mac) => Self::new(
                iface.name.clone(),
                iface.index,
                MacAddr6::new(mac.0, mac.1, mac.2, mac.3, mac.4, mac.5),
            ),
            None => Self {
                name: iface.name.clone(),
                index: iface.index,
                hwtype: 0,
                hwaddr: MacAddr6::nil(),
            },
        }
    }
}

impl fmt::Display for InterfaceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (index {}, {})", self.name, self.index, self.hwaddr)
    }
}
