//! Domain types shared by the supervisor and its capture workers.
//!
//! Everything here is a plain value type with a fixed wire encoding;
//! nothing in this module touches sockets or processes.

pub mod frame;
mod interface;
mod key;
mod protocol;

pub use frame::{FrameFlags, FLAGS_LEN, FRAMELEN_MAX};
pub use interface::{InterfaceSnapshot, HWTYPE_ETHER, IF_NAMESIZE, SNAPSHOT_LEN};
pub use key::RoutingKey;
pub use protocol::{
    CommandCode, FilterFn, Protocol, ProtocolInfo, ETHERTYPE_ARP, ETHERTYPE_IP,
};
