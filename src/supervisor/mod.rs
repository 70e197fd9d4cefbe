//! Privileged side: owns the worker registry and routes messages.
//!
//! The supervisor receives commands on the root channel (START, STOP or a
//! frame to inject) and frames on each worker channel. Everything runs on
//! one thread; reader tasks turn channel traffic into [`SupervisorEvent`]s
//! on a single queue, so frames from a worker are seen in capture order.

mod handler;
mod interfaces;
mod launcher;
mod registry;

pub use handler::{FrameHandler, LoggingHandler};
pub use interfaces::Interfaces;
pub use launcher::{ExecLauncher, Launched, Launcher, WORKER_CHANNEL_FD};
pub use registry::{Worker, WorkerRegistry};

use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::domain::{frame, InterfaceSnapshot, Protocol, RoutingKey, SNAPSHOT_LEN};
use crate::error::{DispatchError, ProtocolError, TransportError};
use crate::ipc::{recv_async, CommandMessage, ControlChannel, MessageHeader};

/// How long shutdown waits for stopped workers to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Something for the supervisor loop to act on.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// A command from the root channel.
    Command(CommandMessage),
    /// A message from the worker `pid` serving `key`.
    Message {
        key: RoutingKey,
        pid: u32,
        message: CommandMessage,
    },
    /// The channel of worker `pid` closed.
    Closed { key: RoutingKey, pid: u32 },
    /// The root channel closed.
    RootClosed,
}

/// Result of a root command that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Started(u32),
    AlreadyRunning,
    Stopped,
    NotRunning,
    /// Frame handed to the worker; bytes written.
    Forwarded(usize),
    /// The worker's channel was full and the frame was dropped.
    Dropped,
}

pub struct Supervisor<L: Launcher, H: FrameHandler> {
    registry: WorkerRegistry,
    interfaces: Interfaces,
    launcher: L,
    handler: H,
}

impl<L: Launcher, H: FrameHandler> Supervisor<L, H> {
    pub fn new(interfaces: Interfaces, launcher: L, handler: H) -> Self {
        Self {
            registry: WorkerRegistry::new(),
            interfaces,
            launcher,
            handler,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn interfaces(&self) -> &Interfaces {
        &self.interfaces
    }

    pub fn set_interfaces(&mut self, interfaces: Interfaces) {
        self.interfaces = interfaces;
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Act on a command from the root channel.
    pub fn handle_command(&mut self, msg: &CommandMessage) -> Result<CommandOutcome, DispatchError> {
        let code = msg.code();
        let protocol = code.protocol()?;
        if code.is_start() && code.is_stop() {
            return Err(ProtocolError::InvalidRequest(format!("{} is both START and STOP", code)).into());
        }
        if msg.key().protocol() != Some(protocol) {
            return Err(ProtocolError::InvalidRequest(format!(
                "key {} does not match command {}",
                msg.key(),
                code
            ))
            .into());
        }

        if code.is_start() {
            return self.start_worker(protocol, msg);
        }
        if code.is_stop() {
            return Ok(self.stop_worker(msg.key()));
        }

        let worker = self
            .registry
            .find_worker(msg.key())
            .ok_or(ProtocolError::WorkerNotFound(*msg.key()))?;
        match worker.send(&msg.header, &msg.payload) {
            Ok(n) => Ok(CommandOutcome::Forwarded(n)),
            Err(e) if e.is_would_block() => {
                warn!("handle_command: {} is not keeping up, dropped frame", worker.title());
                Ok(CommandOutcome::Dropped)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn start_worker(&mut self, protocol: Protocol, msg: &CommandMessage) -> Result<CommandOutcome, DispatchError> {
        let key = *msg.key();
        if self.registry.find_worker(&key).is_some() {
            debug!("start_worker: {} already running", key);
            return Ok(CommandOutcome::AlreadyRunning);
        }
        if msg.payload.len() != SNAPSHOT_LEN {
            return Err(ProtocolError::PayloadLength {
                expected: SNAPSHOT_LEN,
                actual: msg.payload.len(),
            }
            .into());
        }
        let ifp = InterfaceSnapshot::decode(&msg.payload)?;
        if ifp.index != key.ifindex {
            return Err(ProtocolError::InvalidRequest(format!(
                "interface {} has index {}, key says {}",
                ifp.name, ifp.index, key.ifindex
            ))
            .into());
        }

        let launched = {
            let Some(worker) = self.registry.new_worker(Worker::new(protocol, ifp, key.addr)) else {
                return Ok(CommandOutcome::AlreadyRunning);
            };
            self.launcher.start_worker(worker, msg)
        };

        match launched {
            Ok(launched) => {
                let pid = launched.pid;
                if let Some(worker) = self.registry.find_worker_mut(&key) {
                    worker.pid = Some(pid);
                    worker.channel = Some(launched.channel);
                    info!("start_worker: {} running as pid {}", worker.title(), pid);
                }
                Ok(CommandOutcome::Started(pid))
            }
            Err(e) => {
                self.registry.free_worker(&key);
                Err(e.into())
            }
        }
    }

    /// Detach the worker for `key` and tell it to stop.
    ///
    /// The record is kept until the worker's channel closes.
    pub fn stop_worker(&mut self, key: &RoutingKey) -> CommandOutcome {
        let Some(worker) = self.registry.free_worker(key) else {
            debug!("stop_worker: {} not running", key);
            return CommandOutcome::NotRunning;
        };

        let header = MessageHeader::new(worker.protocol.stop(), worker.key);
        match worker.send(&header, &[]) {
            Ok(_) => debug!("stop_worker: sent STOP to {}", worker.title()),
            Err(TransportError::PeerClosed) => debug!("stop_worker: {} already gone", worker.title()),
            Err(e) => {
                warn!("stop_worker: {}: {}, closing its channel", worker.title(), e);
                if let Err(e) = worker.close() {
                    warn!("stop_worker: {}: {}", worker.title(), e);
                }
            }
        }
        self.registry.retire(worker);
        CommandOutcome::Stopped
    }

    /// Route a message that arrived on the channel of worker `pid`.
    pub fn dispatch(&mut self, key: RoutingKey, pid: u32, msg: &CommandMessage) -> Result<(), DispatchError> {
        let code = msg.code();
        if !code.is_frame() {
            return Err(ProtocolError::IpcViolation(format!("worker {} sent command {}", pid, code)).into());
        }
        let protocol = code.protocol()?;
        if *msg.key() != key || key.protocol() != Some(protocol) {
            return Err(ProtocolError::IpcViolation(format!(
                "worker {} for {} sent {} frame for {}",
                pid,
                key,
                protocol,
                msg.key()
            ))
            .into());
        }
        if !self.registry.is_current(&key, pid) {
            debug!("dispatch: dropping frame from retired worker {}", pid);
            return Ok(());
        }

        let (flags, frame) = frame::decode(&msg.payload)?;
        let ifp = self
            .interfaces
            .find_by_index(key.ifindex)
            .ok_or(ProtocolError::UnknownInterface(key.ifindex))?;

        match protocol {
            Protocol::Arp => self.handler.arp_packet(ifp, frame, flags),
            Protocol::Bootp => self.handler.bootp_packet(ifp, frame, flags),
        }
        Ok(())
    }

    /// The channel of worker `pid` closed: its process is gone.
    pub fn worker_closed(&mut self, key: RoutingKey, pid: u32) {
        match self.registry.release(&key, pid) {
            Some(worker) => debug!("worker_closed: released {} (pid {})", worker.title(), pid),
            None => debug!("worker_closed: no record for {} pid {}", key, pid),
        }
    }

    /// Stop every running worker. Returns how many were stopped.
    pub fn shutdown(&mut self) -> usize {
        let keys = self.registry.keys();
        for key in &keys {
            self.stop_worker(key);
        }
        keys.len()
    }

    /// Process events until the root channel closes or a terminating
    /// signal arrives, then stop all workers.
    pub async fn run(&mut self, mut events: UnboundedReceiver<SupervisorEvent>) -> Result<(), DispatchError> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(TransportError::Io)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(TransportError::Io)?;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event)? {
                        break;
                    }
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
            }
        }

        self.drain(&mut events).await;
        Ok(())
    }

    /// Handle one event. Returns `Ok(false)` once the root channel is gone.
    fn handle_event(&mut self, event: SupervisorEvent) -> Result<bool, DispatchError> {
        match event {
            SupervisorEvent::Command(msg) => match self.handle_command(&msg) {
                Ok(outcome) => debug!("handle_command: {} {:?}", msg.key(), outcome),
                Err(e) if e.is_fatal() => {
                    error!("handle_command: {}", e);
                    self.shutdown();
                    return Err(e);
                }
                Err(e) => error!("handle_command: {}", e),
            },
            SupervisorEvent::Message { key, pid, message } => {
                if let Err(e) = self.dispatch(key, pid, &message) {
                    error!("dispatch: {}", e);
                }
            }
            SupervisorEvent::Closed { key, pid } => self.worker_closed(key, pid),
            SupervisorEvent::RootClosed => {
                info!("Root channel closed, shutting down");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Stop all workers and wait a little for them to exit.
    async fn drain(&mut self, events: &mut UnboundedReceiver<SupervisorEvent>) {
        if self.shutdown() == 0 && self.registry.retiring_len() == 0 {
            return;
        }
        let wait = async {
            while self.registry.retiring_len() > 0 {
                match events.recv().await {
                    Some(SupervisorEvent::Closed { key, pid }) => self.worker_closed(key, pid),
                    Some(_) => {}
                    None => break,
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, wait).await.is_err() {
            warn!("Shutdown: {} workers did not exit in time", self.registry.retiring_len());
        }
    }
}

/// Forward messages from a worker channel until it closes.
pub async fn watch_worker(
    channel: ControlChannel,
    key: RoutingKey,
    pid: u32,
    events: UnboundedSender<SupervisorEvent>,
) {
    let channel = match AsyncFd::new(channel) {
        Ok(channel) => channel,
        Err(e) => {
            error!("watch_worker: {}: {}", key, e);
            let _ = events.send(SupervisorEvent::Closed { key, pid });
            return;
        }
    };

    loop {
        match recv_async(&channel).await {
            Ok(Some(message)) => {
                if events.send(SupervisorEvent::Message { key, pid, message }).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e @ (TransportError::ShortMessage(_) | TransportError::Truncated(_))) => {
                warn!("watch_worker: {}: {}", key, e);
            }
            Err(e) => {
                error!("watch_worker: {}: {}", key, e);
                break;
            }
        }
    }
    let _ = events.send(SupervisorEvent::Closed { key, pid });
}

/// Forward commands from the root channel until it closes.
pub async fn watch_root(channel: ControlChannel, events: UnboundedSender<SupervisorEvent>) {
    let channel = match AsyncFd::new(channel) {
        Ok(channel) => channel,
        Err(e) => {
            error!("watch_root: {}", e);
            let _ = events.send(SupervisorEvent::RootClosed);
            return;
        }
    };

    loop {
        match recv_async(&channel).await {
            Ok(Some(msg)) => {
                if events.send(SupervisorEvent::Command(msg)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e @ (TransportError::ShortMessage(_) | TransportError::Truncated(_))) => {
                warn!("watch_root: {}", e);
            }
            Err(e) => {
                error!("watch_root: {}", e);
                break;
            }
        }
    }
    let _ = events.send(SupervisorEvent::RootClosed);
}
