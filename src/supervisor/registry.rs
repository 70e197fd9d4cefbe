//! Worker records owned by the supervisor.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use crate::domain::{InterfaceSnapshot, Protocol, ProtocolInfo, RoutingKey};
use crate::error::TransportError;
use crate::ipc::{MessageHeader, MessageSink};
use crate::worker::process_title;

/// One capture worker as seen from the supervisor.
pub struct Worker {
    pub key: RoutingKey,
    pub protocol: Protocol,
    /// Set once the worker process has been spawned.
    pub pid: Option<u32>,
    /// Supervisor end of the worker's control channel.
    pub channel: Option<Box<dyn MessageSink>>,
    pub ifp: InterfaceSnapshot,
}

impl Worker {
    pub fn new(protocol: Protocol, ifp: InterfaceSnapshot, addr: Option<Ipv4Addr>) -> Self {
        Self {
            key: RoutingKey::new(protocol, ifp.index, addr),
            protocol,
            pid: None,
            channel: None,
            ifp,
        }
    }

    pub fn info(&self) -> &'static ProtocolInfo {
        self.protocol.info()
    }

    pub fn title(&self) -> String {
        process_title(self.protocol, &self.ifp.name, self.key.addr)
    }

    /// Send a message down the worker's channel.
    pub fn send(&self, header: &MessageHeader, payload: &[u8]) -> Result<usize, TransportError> {
        match &self.channel {
            Some(channel) => channel.send_message(header, payload),
            None => Err(TransportError::PeerClosed),
        }
    }

    /// Stop sending to the worker; it reads end-of-file and exits.
    pub fn close(&self) -> Result<(), TransportError> {
        match &self.channel {
            Some(channel) => channel.close(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("key", &self.key)
            .field("protocol", &self.protocol)
            .field("pid", &self.pid)
            .field("channel", &self.channel.is_some())
            .field("ifp", &self.ifp)
            .finish()
    }
}

/// Running workers by key, plus stopped workers whose process has not
/// exited yet.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    active: HashMap<RoutingKey, Worker>,
    retiring: Vec<Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_worker(&self, key: &RoutingKey) -> Option<&Worker> {
        self.active.get(key)
    }

    pub fn find_worker_mut(&mut self, key: &RoutingKey) -> Option<&mut Worker> {
        self.active.get_mut(key)
    }

    /// Add a record. Returns `None` if the key is already taken.
    pub fn new_worker(&mut self, worker: Worker) -> Option<&mut Worker> {
        match self.active.entry(worker.key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => Some(entry.insert(worker)),
        }
    }

    /// Detach the record for `key`, making the key free for a new worker.
    pub fn free_worker(&mut self, key: &RoutingKey) -> Option<Worker> {
        self.active.remove(key)
    }

    /// Keep a detached record until its process is gone.
    pub fn retire(&mut self, worker: Worker) {
        self.retiring.push(worker);
    }

    /// Drop the record for the process `pid` that served `key`.
    ///
    /// Retiring records are checked first. An active record is only
    /// released when its pid matches, so a late close from an old process
    /// never frees its replacement.
    pub fn release(&mut self, key: &RoutingKey, pid: u32) -> Option<Worker> {
        if let Some(pos) = self
            .retiring
            .iter()
            .position(|w| w.key == *key && w.pid == Some(pid))
        {
            return Some(self.retiring.swap_remove(pos));
        }
        match self.active.get(key) {
            Some(w) if w.pid == Some(pid) => self.active.remove(key),
            _ => None,
        }
    }

    /// Whether `pid` is the running worker for `key`.
    pub fn is_current(&self, key: &RoutingKey, pid: u32) -> bool {
        self.active.get(key).is_some_and(|w| w.pid == Some(pid))
    }

    pub fn keys(&self) -> Vec<RoutingKey> {
        self.active.keys().copied().collect()
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.active.values()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn retiring_len(&self) -> usize {
        self.retiring.len()
    }
}
