//! Client side of the root channel: opening, closing and injecting.

use std::net::Ipv4Addr;

use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::util::MacAddr;

use crate::domain::{CommandCode, InterfaceSnapshot, Protocol, RoutingKey, FRAMELEN_MAX};
use crate::error::{DispatchError, ProtocolError};
use crate::ipc::{MessageHeader, MessageSink};

/// Length of an Ethernet ARP frame without padding.
pub const ARP_FRAME_LEN: usize = 14 + 28;

/// Sends worker commands to the supervisor.
#[derive(Debug)]
pub struct Injector<S: MessageSink> {
    sink: S,
}

impl<S: MessageSink> Injector<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn into_inner(self) -> S {
        self.sink
    }

    /// Start an ARP worker on `ifp` for `addr`.
    pub fn open_arp(&self, ifp: &InterfaceSnapshot, addr: Ipv4Addr) -> Result<usize, DispatchError> {
        self.send(Protocol::Arp.start(), ifp, Some(addr), &ifp.encode())
    }

    pub fn close_arp(&self, ifp: &InterfaceSnapshot, addr: Ipv4Addr) -> Result<usize, DispatchError> {
        self.send(Protocol::Arp.stop(), ifp, Some(addr), &[])
    }

    /// Transmit `frame` through the ARP worker for `addr` on `ifp`.
    pub fn send_arp(
        &self,
        ifp: &InterfaceSnapshot,
        addr: Ipv4Addr,
        frame: &[u8],
    ) -> Result<usize, DispatchError> {
        self.send(Protocol::Arp.command(), ifp, Some(addr), frame)
    }

    /// Start the BOOTP worker on `ifp`.
    pub fn open_bootp(&self, ifp: &InterfaceSnapshot) -> Result<usize, DispatchError> {
        self.send(Protocol::Bootp.start(), ifp, None, &ifp.encode())
    }

    pub fn close_bootp(&self, ifp: &InterfaceSnapshot) -> Result<usize, DispatchError> {
        self.send(Protocol::Bootp.stop(), ifp, None, &[])
    }

    pub fn send_bootp(&self, ifp: &InterfaceSnapshot, frame: &[u8]) -> Result<usize, DispatchError> {
        self.send(Protocol::Bootp.command(), ifp, None, frame)
    }

    fn send(
        &self,
        code: CommandCode,
        ifp: &InterfaceSnapshot,
        addr: Option<Ipv4Addr>,
        payload: &[u8],
    ) -> Result<usize, DispatchError> {
        if payload.len() > FRAMELEN_MAX {
            return Err(ProtocolError::OversizedFrame(payload.len()).into());
        }
        let protocol = code.protocol()?;
        let header = MessageHeader::new(code, RoutingKey::new(protocol, ifp.index, addr));
        Ok(self.sink.send_message(&header, payload)?)
    }
}

/// Build an ARP probe for `target` from `ifp`: a broadcast request with
/// an unspecified sender address.
pub fn arp_probe(ifp: &InterfaceSnapshot, target: Ipv4Addr) -> Vec<u8> {
    let [a, b, c, d, e, f] = ifp.hwaddr.into_array();
    let hwaddr = MacAddr::new(a, b, c, d, e, f);
    let mut buf = vec![0u8; ARP_FRAME_LEN];

    if let Some(mut eth) = MutableEthernetPacket::new(&mut buf[..14]) {
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(hwaddr);
        eth.set_ethertype(EtherTypes::Arp);
    }
    if let Some(mut arp) = MutableArpPacket::new(&mut buf[14..]) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(hwaddr);
        arp.set_sender_proto_addr(Ipv4Addr::UNSPECIFIED);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target);
    }
    buf
}
