//! Command messages exchanged between the supervisor and its workers.
//!
//! Wire format, one message per transport send:
//!
//! ```text
//! [code: u16 LE] [proto: u8] [reserved: u8] [ifindex: u32 LE] [addr: 4 bytes] [payload ...]
//! ```
//!
//! The payload length is whatever remains after the 12 byte header; the
//! transport keeps message boundaries so nothing inside the payload is
//! self-delimiting.

mod channel;

pub use channel::{recv_async, ControlChannel};

use std::net::Ipv4Addr;

use crate::domain::{CommandCode, RoutingKey, FLAGS_LEN, FRAMELEN_MAX, SNAPSHOT_LEN};
use crate::error::TransportError;

/// Encoded header size.
pub const HEADER_LEN: usize = 12;

/// Largest message either side ever sends.
pub const MAX_MESSAGE_LEN: usize = HEADER_LEN + FLAGS_LEN + FRAMELEN_MAX;

const _: () = assert!(SNAPSHOT_LEN <= MAX_MESSAGE_LEN - HEADER_LEN);

/// Command code and routing key of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub code: CommandCode,
    pub key: RoutingKey,
}

impl MessageHeader {
    pub fn new(code: CommandCode, key: RoutingKey) -> Self {
        Self { code, key }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.code.0.to_le_bytes());
        buf[2] = self.key.proto;
        buf[4..8].copy_from_slice(&self.key.ifindex.to_le_bytes());
        let addr = self.key.addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
        buf[8..12].copy_from_slice(&addr.octets());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < HEADER_LEN {
            return Err(TransportError::ShortMessage(data.len()));
        }
        let code = CommandCode(u16::from_le_bytes([data[0], data[1]]));
        let ifindex = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let addr = Ipv4Addr::new(data[8], data[9], data[10], data[11]);

        Ok(Self {
            code,
            key: RoutingKey {
                proto: data[2],
                ifindex,
                addr: (!addr.is_unspecified()).then_some(addr),
            },
        })
    }
}

/// A decoded message: header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl CommandMessage {
    pub fn new(header: MessageHeader, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    pub fn code(&self) -> CommandCode {
        self.header.code
    }

    pub fn key(&self) -> &RoutingKey {
        &self.header.key
    }

    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        let header = MessageHeader::decode(data)?;
        Ok(Self {
            header,
            payload: data[HEADER_LEN..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Anything a command message can be written to.
///
/// The header and payload are handed over separately so that callers can
/// send a payload straight out of their own buffer.
pub trait MessageSink {
    /// Send one message, returning the number of bytes written.
    fn send_message(&self, header: &MessageHeader, payload: &[u8]) -> Result<usize, TransportError>;

    /// Stop sending. The peer reads end-of-file once its queue is empty.
    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<S: MessageSink + ?Sized> MessageSink for &S {
    fn send_message(&self, header: &MessageHeader, payload: &[u8]) -> Result<usize, TransportError> {
        (**self).send_message(header, payload)
    }

    fn close(&self) -> Result<(), TransportError> {
        (**self).close()
    }
}

impl<S: MessageSink + ?Sized> MessageSink for Box<S> {
    fn send_message(&self, header: &MessageHeader, payload: &[u8]) -> Result<usize, TransportError> {
        (**self).send_message(header, payload)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// Records every message sent through it. Clones share the record.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSink {
        pub sent: Rc<RefCell<Vec<CommandMessage>>>,
        pub fail_with: Rc<RefCell<Option<fn() -> TransportError>>>,
    }

    impl RecordingSink {
        pub fn messages(&self) -> Vec<CommandMessage> {
            self.sent.borrow().clone()
        }

        pub fn take(&self) -> Vec<CommandMessage> {
            std::mem::take(&mut *self.sent.borrow_mut())
        }

        pub fn fail(&self, make: fn() -> TransportError) {
            *self.fail_with.borrow_mut() = Some(make);
        }
    }

    impl MessageSink for RecordingSink {
        fn send_message(
            &self,
            header: &MessageHeader,
            payload: &[u8],
        ) -> Result<usize, TransportError> {
            if let Some(make) = *self.fail_with.borrow() {
                return Err(make());
            }
            self.sent
                .borrow_mut()
                .push(CommandMessage::new(*header, payload));
            Ok(HEADER_LEN + payload.len())
        }
    }
}
