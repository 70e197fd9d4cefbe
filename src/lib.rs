//! privcap - privilege-separated raw packet capture and injection.
//!
//! A privileged supervisor starts one unprivileged worker process per
//! (protocol, interface, address). Each worker owns a filtered packet
//! socket, forwards captured ARP or BOOTP frames to the supervisor over a
//! control channel and writes frames the supervisor injects.

#[cfg(not(target_os = "linux"))]
compile_error!("privcap needs Linux AF_PACKET sockets");

pub mod capture;
pub mod config;
pub mod domain;
pub mod error;
pub mod inject;
pub mod ipc;
pub mod sandbox;
pub mod supervisor;
pub mod worker;
