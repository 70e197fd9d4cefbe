//! `SOCK_SEQPACKET` control channel.
//!
//! Sequenced packets keep message boundaries (one send, one receive) and
//! report a closed peer as end-of-file, which is how the supervisor learns
//! that a worker exited.
//!
//! Both ends are non-blocking. A send that finds the peer's queue full
//! fails with `WouldBlock` instead of stalling the sender.

use std::io::{self, IoSlice};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Socket, Type};
use tokio::io::unix::AsyncFd;

use super::{CommandMessage, MessageHeader, MessageSink, MAX_MESSAGE_LEN};
use crate::error::TransportError;

/// One end of a supervisor/worker channel.
#[derive(Debug)]
pub struct ControlChannel {
    socket: Socket,
}

impl ControlChannel {
    /// Create a connected pair. Both ends are close-on-exec and non-blocking.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = Socket::pair(Domain::UNIX, Type::SEQPACKET, None)?;
        a.set_nonblocking(true)?;
        b.set_nonblocking(true)?;
        Ok((Self { socket: a }, Self { socket: b }))
    }

    /// Make sure an inherited descriptor does not block.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        self.socket.set_nonblocking(true)
    }

    /// Another handle to the same channel.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            socket: self.socket.try_clone()?,
        })
    }

    /// Wait for the next message. `Ok(None)` means the peer closed.
    ///
    /// Blocks the calling thread in `poll(2)` until the channel is readable.
    /// Inside a runtime use [`recv_async`] instead.
    pub fn recv(&self) -> Result<Option<CommandMessage>, TransportError> {
        loop {
            match self.try_recv() {
                Err(e) if e.is_would_block() => self.wait_readable()?,
                other => return other,
            }
        }
    }

    fn wait_readable(&self) -> Result<(), TransportError> {
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            if unsafe { libc::poll(&mut pfd, 1, -1) } != -1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(TransportError::Io(err));
            }
        }
    }

    /// Like [`recv`](Self::recv) but fails with `WouldBlock` instead of waiting.
    pub fn try_recv(&self) -> Result<Option<CommandMessage>, TransportError> {
        self.recv_with_flags(libc::MSG_DONTWAIT)
    }

    fn recv_with_flags(&self, flags: libc::c_int) -> Result<Option<CommandMessage>, TransportError> {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        // MSG_TRUNC makes the kernel report the real length of an oversized message.
        let n = unsafe {
            libc::recv(
                self.socket.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags | libc::MSG_TRUNC,
            )
        };
        if n == -1 {
            return Err(TransportError::from_io(io::Error::last_os_error()));
        }
        let n = n as usize;
        if n == 0 {
            return Ok(None);
        }
        if n > buf.len() {
            return Err(TransportError::Truncated(n));
        }
        CommandMessage::decode(&buf[..n]).map(Some)
    }
}

impl MessageSink for ControlChannel {
    fn send_message(&self, header: &MessageHeader, payload: &[u8]) -> Result<usize, TransportError> {
        let head = header.encode();
        let bufs = [IoSlice::new(&head), IoSlice::new(payload)];
        self.socket
            .send_vectored_with_flags(&bufs, libc::MSG_NOSIGNAL)
            .map_err(TransportError::from_io)
    }

    fn close(&self) -> Result<(), TransportError> {
        self.socket
            .shutdown(Shutdown::Write)
            .map_err(TransportError::from_io)
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl IntoRawFd for ControlChannel {
    fn into_raw_fd(self) -> RawFd {
        self.socket.into_raw_fd()
    }
}

impl FromRawFd for ControlChannel {
    /// # Safety
    ///
    /// `fd` must be an open `SOCK_SEQPACKET` socket owned by the caller.
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            socket: Socket::from_raw_fd(fd),
        }
    }
}

/// Wait for the next message on a channel registered with the reactor.
pub async fn recv_async(
    channel: &AsyncFd<ControlChannel>,
) -> Result<Option<CommandMessage>, TransportError> {
    loop {
        let mut guard = channel.readable().await?;
        match guard.get_inner().try_recv() {
            Err(e) if e.is_would_block() => {
                guard.clear_ready();
                continue;
            }
            other => return other,
        }
    }
}
