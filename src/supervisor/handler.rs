//! Consumers of frames captured by workers.

use std::net::Ipv4Addr;

use pnet::packet::arp::{ArpOperations, ArpPacket};
use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use tracing::info;

use crate::domain::{FrameFlags, InterfaceSnapshot};

/// Receives frames the supervisor routes out of worker channels.
pub trait FrameHandler {
    fn arp_packet(&mut self, ifp: &InterfaceSnapshot, frame: &[u8], flags: FrameFlags);

    fn bootp_packet(&mut self, ifp: &InterfaceSnapshot, frame: &[u8], flags: FrameFlags);
}

/// Logs a one-line summary of every frame.
#[derive(Debug, Default)]
pub struct LoggingHandler {
    verbose: bool,
}

impl LoggingHandler {
    pub fn new() -> Self {
        Self { verbose: false }
    }

    /// Also log frame flags and lengths.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn format_arp(&self, ifp: &InterfaceSnapshot, frame: &[u8], flags: FrameFlags) -> String {
        let arp = EthernetPacket::new(frame)
            .and_then(|eth| ArpPacket::owned(eth.payload().to_vec()));

        let mut output = match arp {
            Some(arp) => {
                let op = match arp.get_operation() {
                    ArpOperations::Request => "REQUEST",
                    ArpOperations::Reply => "REPLY",
                    _ => "OTHER",
                };
                format!(
                    "[ARP {}] {} | {} ({}) -> {}",
                    op,
                    ifp.name,
                    arp.get_sender_proto_addr(),
                    arp.get_sender_hw_addr(),
                    arp.get_target_proto_addr()
                )
            }
            None => format!("[ARP] {} | short frame", ifp.name),
        };

        if self.verbose {
            output.push_str(&format!(" | {} bytes | flags: {}", frame.len(), flags));
        }
        output
    }

    fn format_bootp(&self, ifp: &InterfaceSnapshot, frame: &[u8], flags: FrameFlags) -> String {
        let mut output = match bootp_summary(frame) {
            Some(b) => format!(
                "[BOOTP {}] {} | XID: {:#010x} | CHADDR: {} | YIADDR: {}",
                if b.op == 2 { "REPLY" } else { "REQUEST" },
                ifp.name,
                b.xid,
                b.chaddr,
                b.yiaddr
            ),
            None => format!("[BOOTP] {} | short frame", ifp.name),
        };

        if flags.contains(FrameFlags::BCAST) {
            output.push_str(" | broadcast");
        }
        if self.verbose {
            output.push_str(&format!(" | {} bytes | flags: {}", frame.len(), flags));
        }
        output
    }
}

impl FrameHandler for LoggingHandler {
    fn arp_packet(&mut self, ifp: &InterfaceSnapshot, frame: &[u8], flags: FrameFlags) {
        info!("{}", self.format_arp(ifp, frame, flags));
    }

    fn bootp_packet(&mut self, ifp: &InterfaceSnapshot, frame: &[u8], flags: FrameFlags) {
        info!("{}", self.format_bootp(ifp, frame, flags));
    }
}

struct BootpSummary {
    op: u8,
    xid: u32,
    yiaddr: Ipv4Addr,
    chaddr: String,
}

fn bootp_summary(frame: &[u8]) -> Option<BootpSummary> {
    let eth = EthernetPacket::new(frame)?;
    let ip = Ipv4Packet::new(eth.payload())?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }
    let udp = UdpPacket::new(ip.payload())?;
    let p = udp.payload();
    if p.len() < 34 {
        return None;
    }

    let chaddr = p[28..34]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":");
    Some(BootpSummary {
        op: p[0],
        xid: u32::from_be_bytes([p[4], p[5], p[6], p[7]]),
        yiaddr: Ipv4Addr::new(p[16], p[17], p[18], p[19]),
        chaddr,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records every frame handed to it, in order.
    #[derive(Debug, Default)]
    pub struct RecordingHandler {
        pub arp: Vec<(u32, Vec<u8>, FrameFlags)>,
        pub bootp: Vec<(u32, Vec<u8>, FrameFlags)>,
    }

    impl FrameHandler for RecordingHandler {
        fn arp_packet(&mut self, ifp: &InterfaceSnapshot, frame: &[u8], flags: FrameFlags) {
            self.arp.push((ifp.index, frame.to_vec(), flags));
        }

        fn bootp_packet(&mut self, ifp: &InterfaceSnapshot, frame: &[u8], flags: FrameFlags) {
            self.bootp.push((ifp.index, frame.to_vec(), flags));
        }
    }
}
