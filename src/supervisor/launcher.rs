//! Spawning worker processes.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use super::registry::Worker;
use super::{watch_worker, SupervisorEvent};
use crate::error::LaunchError;
use crate::ipc::{CommandMessage, ControlChannel, MessageSink};

/// Descriptor the worker finds its control channel on.
pub const WORKER_CHANNEL_FD: RawFd = 3;

/// A worker process that is up and holding its channel.
pub struct Launched {
    pub pid: u32,
    pub channel: Box<dyn MessageSink>,
}

/// Starts the process behind a worker record.
pub trait Launcher {
    /// Start a worker for `worker` and hand it `start` as its first message.
    fn start_worker(
        &mut self,
        worker: &Worker,
        start: &CommandMessage,
    ) -> Result<Launched, LaunchError>;
}

/// Runs each worker as `<program> worker --fd 3`.
///
/// Inbound traffic and closure of every launched channel are reported on
/// `events`. Must be used from within a `LocalSet`.
pub struct ExecLauncher {
    program: PathBuf,
    events: UnboundedSender<SupervisorEvent>,
}

impl ExecLauncher {
    /// Launch workers from the running executable.
    pub fn new(events: UnboundedSender<SupervisorEvent>) -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            events,
        })
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn spawn(&self, child_fd: RawFd) -> io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--fd")
            .arg(WORKER_CHANNEL_FD.to_string())
            .stdin(Stdio::null());

        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if child_fd == WORKER_CHANNEL_FD {
                    if libc::fcntl(child_fd, libc::F_SETFD, 0) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(child_fd, WORKER_CHANNEL_FD) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd.spawn()
    }
}

impl Launcher for ExecLauncher {
    fn start_worker(
        &mut self,
        worker: &Worker,
        start: &CommandMessage,
    ) -> Result<Launched, LaunchError> {
        let (parent, child) = ControlChannel::pair()?;

        let process = self.spawn(child.as_raw_fd())?;
        drop(child);
        let pid = process.id().ok_or(LaunchError::NoPid)?;
        debug!("start_worker: spawned {} as pid {}", worker.title(), pid);

        tokio::task::spawn_local(reap(process, worker.title()));

        parent.send_message(&start.header, &start.payload)?;

        let reader = parent.try_clone()?;
        tokio::task::spawn_local(watch_worker(reader, worker.key, pid, self.events.clone()));

        Ok(Launched {
            pid,
            channel: Box::new(parent),
        })
    }
}

async fn reap(mut child: Child, title: String) {
    match child.wait().await {
        Ok(status) if status.success() => info!("{}: exited", title),
        Ok(status) => warn!("{}: exited with {}", title, status),
        Err(e) => error!("{}: wait failed: {}", title, e),
    }
}
