//! Capture worker process.
//!
//! A worker is started by the supervisor's launcher with one end of a
//! control channel on a known descriptor. Its first message is the START
//! that describes what to capture; after that it relays captured frames up
//! and injected frames down until it is told to stop or the channel closes.

mod capture_loop;

pub use capture_loop::{handle_command, recv_frames, DrainOutcome, WorkerAction};

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::process::ExitCode;

use tokio::io::unix::AsyncFd;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::capture::PacketSocket;
use crate::config::Config;
use crate::domain::{InterfaceSnapshot, Protocol, RoutingKey, SNAPSHOT_LEN};
use crate::error::{CaptureError, ProtocolError, TransportError};
use crate::ipc::{recv_async, CommandMessage, ControlChannel, MessageHeader};
use crate::sandbox::{self, Rights};

/// Process title for a worker capturing `protocol` on `ifname`.
pub fn process_title(protocol: Protocol, ifname: &str, addr: Option<Ipv4Addr>) -> String {
    match addr {
        Some(addr) => format!("[BPF {}] {} {}", protocol, ifname, addr),
        None => format!("[BPF {}] {}", protocol, ifname),
    }
}

/// What a worker was asked to capture, taken from its START message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureWorker {
    pub protocol: Protocol,
    pub key: RoutingKey,
    pub ifp: InterfaceSnapshot,
}

impl CaptureWorker {
    pub fn from_start(msg: &CommandMessage) -> Result<Self, ProtocolError> {
        let code = msg.code();
        let protocol = code.protocol()?;
        if !code.is_start() || code.is_stop() {
            return Err(ProtocolError::InvalidRequest(format!(
                "expected START, got {}",
                code
            )));
        }
        if msg.key().protocol() != Some(protocol) {
            return Err(ProtocolError::InvalidRequest(format!(
                "key {} does not match command {}",
                msg.key(),
                code
            )));
        }
        if msg.payload.len() != SNAPSHOT_LEN {
            return Err(ProtocolError::PayloadLength {
                expected: SNAPSHOT_LEN,
                actual: msg.payload.len(),
            });
        }

        let ifp = InterfaceSnapshot::decode(&msg.payload)?;
        if ifp.index != msg.key().ifindex {
            return Err(ProtocolError::InvalidRequest(format!(
                "interface {} has index {}, key says {}",
                ifp.name,
                ifp.index,
                msg.key().ifindex
            )));
        }

        Ok(Self {
            protocol,
            key: *msg.key(),
            ifp,
        })
    }

    pub fn title(&self) -> String {
        process_title(self.protocol, &self.ifp.name, self.key.addr)
    }

    /// Header carried by every frame this worker forwards.
    pub fn header(&self) -> MessageHeader {
        MessageHeader::new(self.protocol.command(), self.key)
    }
}

/// Worker entry point. `fd` is the worker's end of the control channel.
pub fn run(fd: RawFd, config: &Config) -> ExitCode {
    // SAFETY: the launcher hands us this descriptor and nothing else owns it.
    let channel = unsafe { ControlChannel::from_raw_fd(fd) };
    exit_status(start(channel, config, true))
}

fn exit_status(result: Result<ExitCode, CaptureError>) -> ExitCode {
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("worker: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Wait for START, open the capture socket, shed privileges and serve.
///
/// `close_inherited` closes every descriptor but the channel first, which
/// only a freshly spawned worker process may do.
fn start(channel: ControlChannel, config: &Config, close_inherited: bool) -> Result<ExitCode, CaptureError> {
    channel.set_nonblocking().map_err(TransportError::Io)?;

    let msg = match channel.recv()? {
        Some(msg) => msg,
        None => {
            debug!("worker: supervisor closed before START");
            return Ok(ExitCode::SUCCESS);
        }
    };
    let worker = CaptureWorker::from_start(&msg)?;

    let title = worker.title();
    proctitle::set_title(&title);
    info!("{}: starting", title);

    if close_inherited {
        if let Err(e) = sandbox::close_inherited_fds(&[channel.as_raw_fd()]) {
            warn!("close_inherited_fds: {}", e);
        }
    }

    let socket = PacketSocket::open(&worker.ifp, worker.protocol, worker.key.addr)?;
    sandbox::drop_privileges(&config.privsep_user)?;

    // The runtime opens its own descriptors, which the narrowed worker can't.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CaptureError::Register)?;

    match sandbox::limit_rights(socket.as_raw_fd(), Rights::CAPTURE) {
        Ok(()) => {}
        Err(e) if sandbox::is_unsupported(&e) => warn!("limit_rights: {}", e),
        Err(e) => return Err(CaptureError::Limit(e)),
    }

    runtime.block_on(event_loop(socket, channel, worker, config.max_drain))
}

enum LoopEvent {
    Drained(DrainOutcome),
    Command(Result<Option<CommandMessage>, TransportError>),
    Signal(SignalKind),
}

async fn event_loop(
    socket: PacketSocket,
    channel: ControlChannel,
    worker: CaptureWorker,
    budget: usize,
) -> Result<ExitCode, CaptureError> {
    let mut raw = AsyncFd::new(socket).map_err(CaptureError::Register)?;
    let control = AsyncFd::new(channel).map_err(CaptureError::Register)?;

    let mut sigterm = signal(SignalKind::terminate()).map_err(CaptureError::Register)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(CaptureError::Register)?;
    let mut sighup = signal(SignalKind::hangup()).map_err(CaptureError::Register)?;

    let header = worker.header();
    let title = worker.title();
    info!("{}: ready", title);

    loop {
        let event = tokio::select! {
            guard = raw.readable_mut() => {
                let mut guard = guard.map_err(CaptureError::Register)?;
                let outcome = recv_frames(guard.get_inner_mut(), control.get_ref(), &header, budget);
                // A yielded drain still has frames queued.
                if !matches!(outcome, DrainOutcome::Yielded(_)) {
                    guard.clear_ready();
                }
                LoopEvent::Drained(outcome)
            }
            msg = recv_async(&control) => LoopEvent::Command(msg),
            _ = sigterm.recv() => LoopEvent::Signal(SignalKind::terminate()),
            _ = sigint.recv() => LoopEvent::Signal(SignalKind::interrupt()),
            _ = sighup.recv() => LoopEvent::Signal(SignalKind::hangup()),
        };

        match event {
            LoopEvent::Drained(DrainOutcome::Drained(_) | DrainOutcome::Yielded(_)) => {}
            LoopEvent::Drained(DrainOutcome::PeerClosed) => {
                info!("{}: supervisor went away", title);
                return Ok(ExitCode::SUCCESS);
            }
            LoopEvent::Drained(DrainOutcome::ReadFailed | DrainOutcome::SendFailed) => {
                return Ok(ExitCode::FAILURE);
            }
            LoopEvent::Command(Ok(Some(msg))) => {
                match handle_command(raw.get_mut(), worker.protocol, &msg) {
                    Ok(WorkerAction::Continue) => {}
                    Ok(WorkerAction::Stop) => {
                        info!("{}: stopping", title);
                        return Ok(ExitCode::SUCCESS);
                    }
                    Err(e) => error!("handle_command: {}", e),
                }
            }
            LoopEvent::Command(Ok(None)) => {
                info!("{}: control channel closed", title);
                return Ok(ExitCode::SUCCESS);
            }
            LoopEvent::Command(Err(e)) => {
                error!("{}: control channel: {}", title, e);
                return Ok(ExitCode::FAILURE);
            }
            LoopEvent::Signal(kind) if kind == SignalKind::terminate() => {
                info!("{}: received SIGTERM", title);
                return Ok(ExitCode::SUCCESS);
            }
            LoopEvent::Signal(kind) => {
                info!("{}: received signal {}", title, kind.as_raw_value());
                return Ok(ExitCode::FAILURE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::MessageSink;
    use macaddr::MacAddr6;

    fn eth0() -> InterfaceSnapshot {
        InterfaceSnapshot::new("eth0", 2, MacAddr6::new(0x02, 0, 0, 0, 0, 0x01))
    }

    fn start_msg(protocol: Protocol, addr: Option<Ipv4Addr>, ifp: &InterfaceSnapshot) -> CommandMessage {
        let key = RoutingKey::new(protocol, ifp.index, addr);
        CommandMessage::new(MessageHeader::new(protocol.start(), key), ifp.encode().to_vec())
    }

    fn same_exit(a: ExitCode, b: ExitCode) -> bool {
        format!("{:?}", a) == format!("{:?}", b)
    }

    #[test]
    fn test_start_on_missing_interface_fails() {
        let (supervisor_end, worker_end) = ControlChannel::pair().unwrap();
        let ifp = InterfaceSnapshot::new("gone0", 999_999, MacAddr6::new(0x02, 0, 0, 0, 0, 0x09));
        let msg = start_msg(Protocol::Bootp, None, &ifp);
        supervisor_end.send_message(&msg.header, &msg.payload).unwrap();

        let result = start(worker_end, &Config::default(), false);
        assert!(
            matches!(result, Err(CaptureError::Open(_) | CaptureError::Bind { index: 999_999, .. })),
            "unexpected result {:?}",
            result
        );
        assert!(same_exit(exit_status(result), ExitCode::FAILURE));
    }

    #[test]
    fn test_supervisor_gone_before_start_is_clean_exit() {
        let (supervisor_end, worker_end) = ControlChannel::pair().unwrap();
        drop(supervisor_end);

        let result = start(worker_end, &Config::default(), false);
        assert!(matches!(result, Ok(ref code) if same_exit(*code, ExitCode::SUCCESS)));
        assert!(same_exit(exit_status(result), ExitCode::SUCCESS));
    }

    #[test]
    fn test_start_waits_for_start_message() {
        let (supervisor_end, worker_end) = ControlChannel::pair().unwrap();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            let mut msg = start_msg(Protocol::Arp, None, &eth0());
            msg.payload.truncate(3);
            supervisor_end.send_message(&msg.header, &msg.payload).unwrap();
            supervisor_end
        });

        let result = start(worker_end, &Config::default(), false);
        assert!(matches!(
            result,
            Err(CaptureError::Start(ProtocolError::PayloadLength { actual: 3, .. }))
        ));
        drop(sender.join().unwrap());
    }

    #[test]
    fn test_from_start_arp() {
        let addr = Ipv4Addr::new(192, 0, 2, 5);
        let worker = CaptureWorker::from_start(&start_msg(Protocol::Arp, Some(addr), &eth0())).unwrap();

        assert_eq!(worker.protocol, Protocol::Arp);
        assert_eq!(worker.ifp, eth0());
        assert_eq!(worker.key.addr, Some(addr));
        assert_eq!(worker.title(), "[BPF ARP] eth0 192.0.2.5");
        assert_eq!(worker.header().code, Protocol::Arp.command());
    }

    #[test]
    fn test_bootp_title_has_no_address() {
        let worker = CaptureWorker::from_start(&start_msg(Protocol::Bootp, None, &eth0())).unwrap();
        assert_eq!(worker.title(), "[BPF BOOTP] eth0");
    }

    #[test]
    fn test_from_start_rejects_frame_command() {
        let mut msg = start_msg(Protocol::Arp, None, &eth0());
        msg.header.code = Protocol::Arp.command();
        assert!(matches!(
            CaptureWorker::from_start(&msg),
            Err(ProtocolError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_from_start_rejects_short_snapshot() {
        let mut msg = start_msg(Protocol::Bootp, None, &eth0());
        msg.payload.truncate(SNAPSHOT_LEN - 1);
        assert!(matches!(
            CaptureWorker::from_start(&msg),
            Err(ProtocolError::PayloadLength { expected: SNAPSHOT_LEN, .. })
        ));
    }

    #[test]
    fn test_from_start_rejects_mismatched_key() {
        let mut msg = start_msg(Protocol::Arp, None, &eth0());
        msg.header.key = RoutingKey::new(Protocol::Bootp, 2, None);
        assert!(matches!(
            CaptureWorker::from_start(&msg),
            Err(ProtocolError::InvalidRequest(_))
        ));

        let mut msg = start_msg(Protocol::Arp, None, &eth0());
        msg.header.key.ifindex = 7;
        assert!(matches!(
            CaptureWorker::from_start(&msg),
            Err(ProtocolError::InvalidRequest(_))
        ));
    }
}
