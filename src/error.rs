use std::io;

use thiserror::Error;

use crate::domain::RoutingKey;

/// Violations of the command protocol between supervisor and workers.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unsupported command {0:#06x}")]
    Unsupported(u16),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("payload length mismatch: expected {expected} bytes, got {actual}")]
    PayloadLength { expected: usize, actual: usize },

    #[error("IPC contract violation: {0}")]
    IpcViolation(String),

    #[error("no worker for {0}")]
    WorkerNotFound(RoutingKey),

    #[error("unknown interface index {0}")]
    UnknownInterface(u32),

    #[error("frame envelope too short: {0} bytes")]
    ShortEnvelope(usize),

    #[error("frame too large: {0} bytes")]
    OversizedFrame(usize),
}

impl ProtocolError {
    /// Whether the two sides of the channel have diverged and must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::PayloadLength { .. })
    }
}

/// Failures of the message transport itself.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer closed the channel")]
    PeerClosed,

    #[error("message too short for a header: {0} bytes")]
    ShortMessage(usize),

    #[error("message truncated: {0} bytes")]
    Truncated(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ECONNRESET) | Some(libc::EPIPE) => TransportError::PeerClosed,
            _ => TransportError::Io(err),
        }
    }

    pub(crate) fn is_would_block(&self) -> bool {
        matches!(self, TransportError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

/// Errors raised while setting up a capture worker.
///
/// Every variant is fatal inside the worker.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open packet socket: {0}")]
    Open(#[source] io::Error),

    #[error("failed to attach filter: {0}")]
    Filter(#[source] io::Error),

    #[error("failed to bind to interface index {index}: {source}")]
    Bind {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to limit descriptor rights: {0}")]
    Limit(#[source] io::Error),

    #[error("unknown privilege separation user '{0}'")]
    UnknownUser(String),

    #[error("failed to drop privileges: {0}")]
    Privileges(#[source] io::Error),

    #[error("failed to clear capabilities: {0}")]
    Capabilities(String),

    #[error("failed to register with the event loop: {0}")]
    Register(#[source] io::Error),

    #[error("invalid start message: {0}")]
    Start(#[from] ProtocolError),

    #[error("control channel: {0}")]
    Channel(#[from] TransportError),
}

/// Errors from spawning a worker process.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),

    #[error("spawned worker has no pid")]
    NoPid,

    #[error("failed to hand start message to worker: {0}")]
    Handoff(#[from] TransportError),
}

/// Errors from the supervisor's dispatcher.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl DispatchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Protocol(e) if e.is_fatal())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid {key}: {value}")]
    Invalid { key: String, value: String },
}
