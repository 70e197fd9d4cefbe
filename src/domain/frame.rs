//! Frame envelopes: a flags prefix followed by one raw link-layer frame.
//!
//! Envelopes only travel from a worker to the supervisor. Frames injected
//! by the supervisor are sent to the worker as raw bytes with no prefix.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::ProtocolError;

/// Largest link-layer header we expect (Ethernet).
pub const FRAMEHDRLEN_MAX: usize = 14;

/// Largest frame carried in an envelope (jumbo frame payload).
pub const FRAMELEN_MAX: usize = FRAMEHDRLEN_MAX + 9216;

/// Size of the flags prefix.
pub const FLAGS_LEN: usize = 4;

/// Out-of-band annotations a raw handle attaches to each captured frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u32);

impl FrameFlags {
    /// The handle has no more buffered frames.
    pub const EOF: FrameFlags = FrameFlags(0x01);
    /// The frame checksum was left for hardware offload.
    pub const PARTIAL_CSUM: FrameFlags = FrameFlags(0x02);
    /// The frame was a link-layer broadcast.
    pub const BCAST: FrameFlags = FrameFlags(0x04);

    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        FrameFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FrameFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: FrameFlags, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: FrameFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Write `flags` into the reserved prefix of an envelope buffer.
pub(crate) fn write_flags(buf: &mut [u8], flags: FrameFlags) -> Result<(), ProtocolError> {
    let len = buf.len();
    let prefix = buf
        .get_mut(..FLAGS_LEN)
        .ok_or(ProtocolError::ShortEnvelope(len))?;
    prefix.copy_from_slice(&flags.bits().to_le_bytes());
    Ok(())
}

/// Build an envelope from flags and a frame.
pub fn encode(flags: FrameFlags, frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if frame.len() > FRAMELEN_MAX {
        return Err(ProtocolError::OversizedFrame(frame.len()));
    }
    let mut buf = vec![0u8; FLAGS_LEN + frame.len()];
    write_flags(&mut buf, flags)?;
    buf[FLAGS_LEN..].copy_from_slice(frame);
    Ok(buf)
}

/// Split an envelope into its flags and frame bytes.
pub fn decode(payload: &[u8]) -> Result<(FrameFlags, &[u8]), ProtocolError> {
    if payload.len() < FLAGS_LEN {
        return Err(ProtocolError::ShortEnvelope(payload.len()));
    }
    let frame = &payload[FLAGS_LEN..];
    if frame.len() > FRAMELEN_MAX {
        return Err(ProtocolError::OversizedFrame(frame.len()));
    }
    let bits = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((FrameFlags::from_bits(bits), frame))
}
