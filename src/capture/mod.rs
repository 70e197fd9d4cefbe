//! Raw filtering handles.
//!
//! This module defines the `RawHandle` trait the capture loop drains, and
//! a Linux `AF_PACKET` implementation. Tests drive the capture loop with
//! scripted handles instead of a real socket.

pub mod filter;
mod packet_socket;

pub use packet_socket::PacketSocket;

use std::io;

use crate::domain::FrameFlags;

/// One raw capture/injection handle owned by a worker.
pub trait RawHandle {
    /// Read one frame into `buf`.
    ///
    /// `Ok(0)` means nothing more can be read right now (closed, or the
    /// buffer was already drained). Implementations set
    /// [`FrameFlags::EOF`] once the last buffered frame has been returned.
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete frame.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize>;

    /// Flags describing the frame most recently read.
    fn flags(&self) -> FrameFlags;

    fn flags_mut(&mut self) -> &mut FrameFlags;
}
