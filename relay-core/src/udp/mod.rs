//! UDP flow table and the two worker loops (send, receive) that share it.

mod flow_table;
mod receive;
mod send;

pub use flow_table::{UdpFlowEntry, UdpFlowTable};
pub use receive::UdpReceiveLoop;
pub use send::UdpSendLoop;

use crate::flow::SlotId;
use std::net::Ipv4Addr;

/// A newly opened UDP flow, handed from the send loop to the receive loop
/// over the UDP-tunnel-registration queue so the latter can register the
/// socket with the selector. Carries the addressing the receive loop needs
/// to build a reply packet, since that information only exists as the
/// original flow key on the send side.
pub struct UdpRegistration {
    pub slot: SlotId,
    pub socket: std::net::UdpSocket,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub local_port: u16,
}
