//! Frame relay between a worker's raw handle and its control channel.

use tracing::{debug, error, warn};

use crate::capture::RawHandle;
use crate::domain::{frame, FrameFlags, Protocol, FLAGS_LEN, FRAMELEN_MAX};
use crate::error::{ProtocolError, TransportError};
use crate::ipc::{CommandMessage, MessageHeader, MessageSink};

/// How one drain pass over the raw handle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The handle has nothing more buffered.
    Drained(usize),
    /// The per-wakeup budget ran out with frames still buffered.
    Yielded(usize),
    /// Reading the raw handle failed.
    ReadFailed,
    /// The supervisor closed its end.
    PeerClosed,
    /// Sending to the supervisor failed for another reason.
    SendFailed,
}

/// Forward every buffered frame on `handle` to the supervisor.
///
/// Each frame is sent as one message with `header`, its payload being the
/// handle's current flags followed by the frame bytes. At most `budget`
/// frames are read per call. A frame the channel has no room for is
/// dropped so a slow supervisor never blocks the worker.
pub fn recv_frames<H, S>(handle: &mut H, sink: &S, header: &MessageHeader, budget: usize) -> DrainOutcome
where
    H: RawHandle + ?Sized,
    S: MessageSink + ?Sized,
{
    let mut buf = vec![0u8; FLAGS_LEN + FRAMELEN_MAX];
    let mut forwarded = 0;
    let mut dropped = 0;

    handle.flags_mut().remove(FrameFlags::EOF);
    // One readiness event can cover several queued frames.
    while !handle.flags().contains(FrameFlags::EOF) {
        if forwarded + dropped == budget {
            return DrainOutcome::Yielded(forwarded);
        }

        let len = match handle.read_frame(&mut buf[FLAGS_LEN..]) {
            Ok(0) => break,
            Ok(len) => len,
            Err(e) => {
                error!("recv_frames: {}", e);
                return DrainOutcome::ReadFailed;
            }
        };

        if let Err(e) = frame::write_flags(&mut buf, handle.flags()) {
            error!("recv_frames: {}", e);
            return DrainOutcome::SendFailed;
        }
        match sink.send_message(header, &buf[..FLAGS_LEN + len]) {
            Ok(_) => forwarded += 1,
            Err(e) if e.is_would_block() => {
                dropped += 1;
                warn!("recv_frames: control channel full, dropped {} byte frame", len);
            }
            Err(TransportError::PeerClosed) => {
                debug!("recv_frames: supervisor closed the channel");
                return DrainOutcome::PeerClosed;
            }
            Err(e) => {
                error!("recv_frames: {}", e);
                return DrainOutcome::SendFailed;
            }
        }
    }

    if dropped > 0 {
        debug!("recv_frames: forwarded {}, dropped {}", forwarded, dropped);
    }
    DrainOutcome::Drained(forwarded)
}

/// What the worker should do after a command from the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAction {
    Continue,
    Stop,
}

/// Act on a command the supervisor sent to this worker.
///
/// Frame commands for the worker's own protocol are written to the raw
/// handle exactly as received. STOP asks the worker to exit. Nothing else
/// should ever arrive on a running worker's channel.
pub fn handle_command<H>(
    handle: &mut H,
    protocol: Protocol,
    msg: &CommandMessage,
) -> Result<WorkerAction, ProtocolError>
where
    H: RawHandle + ?Sized,
{
    let code = msg.code();
    if code.protocol()? != protocol {
        return Err(ProtocolError::IpcViolation(format!(
            "command {} sent to {} worker",
            code, protocol
        )));
    }
    if code.is_stop() {
        return Ok(WorkerAction::Stop);
    }
    if code.is_start() {
        return Err(ProtocolError::InvalidRequest(format!(
            "{} worker is already started",
            protocol
        )));
    }
    if msg.payload.len() > FRAMELEN_MAX {
        return Err(ProtocolError::OversizedFrame(msg.payload.len()));
    }

    match handle.write_frame(&msg.payload) {
        Ok(n) if n != msg.payload.len() => {
            error!("handle_command: short write {} of {} bytes", n, msg.payload.len());
        }
        Ok(_) => {}
        Err(e) => error!("handle_command: {}", e),
    }
    Ok(WorkerAction::Continue)
}
