use super::flow_table::UdpFlowTable;
use super::UdpRegistration;
use crate::codec::{self, ParsedIpv4};
use crate::flow::UdpFlowKey;
use crate::packet::Packet;
use crate::protect::ProtectFn;
use crate::queue::{QueueReceiver, QueueSender};
use crate::socket;
use relay_support::error::RelayError;
use relay_support::logging::Logger;
use slog::{debug, warn};
use std::net::SocketAddr;
use std::sync::Arc;

/// Consumes UDP-ingress packets, maintaining the send-side half of the UDP
/// flow table. Runs on its own thread (`relay-udp`).
pub struct UdpSendLoop {
    flows: UdpFlowTable,
    protect: ProtectFn,
    ingress: QueueReceiver<Packet>,
    registrations: QueueSender<UdpRegistration>,
    wake: Arc<mio::Waker>,
    log: Logger,
}

impl UdpSendLoop {
    pub fn new(
        protect: ProtectFn,
        ingress: QueueReceiver<Packet>,
        registrations: QueueSender<UdpRegistration>,
        wake: Arc<mio::Waker>,
        log: Logger,
    ) -> UdpSendLoop {
        UdpSendLoop {
            flows: UdpFlowTable::new(),
            protect,
            ingress,
            registrations,
            wake,
            log,
        }
    }

    /// Blocks on the UDP-ingress queue and processes packets until the
    /// queue disconnects (engine teardown drops the sender).
    pub fn run(&mut self) {
        while let Some(packet) = self.ingress.recv_blocking() {
            self.handle(packet);
        }
    }

    /// Processes a single dequeued packet. Exposed separately from `run` so
    /// tests can drive the loop deterministically.
    pub fn handle(&mut self, packet: Packet) {
        let parsed = match codec::parse_ipv4(packet.as_slice()) {
            Ok(ParsedIpv4::Udp(udp)) => udp,
            Ok(_) => return,
            Err(err) => {
                debug!(self.log, "dropping malformed udp packet"; "reason" => err.0);
                return;
            }
        };

        let key = UdpFlowKey::new(parsed.dst_addr, parsed.header.destination_port(), parsed.header.source_port());

        if self.flows.get(&key).is_none() {
            if !self.open_flow(key, parsed.dst_addr, parsed.header.destination_port()) {
                return;
            }
        }

        let socket = self.flows.get(&key).expect("flow just inserted");

        // Per the flow-level contract any write error evicts, WouldBlock
        // included: a connected datagram socket backing up is treated the
        // same as a hard failure rather than buffered and retried.
        if let Err(err) = socket.send(parsed.payload) {
            warn!(self.log, "udp upstream write failed, evicting flow"; "error" => ?RelayError::from(err));
            self.flows.remove(&key);
        }
    }

    fn open_flow(&mut self, key: UdpFlowKey, dst_addr: std::net::Ipv4Addr, dst_port: u16) -> bool {
        let dst: SocketAddr = SocketAddr::new(dst_addr.into(), dst_port);

        let socket = match socket::connect_udp(&self.protect, dst) {
            Ok(socket) => socket,
            Err(err) => {
                debug!(self.log, "udp connect failed, dropping packet"; "dst" => %dst, "error" => %err);
                return false;
            }
        };

        let registration_copy = match socket.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                warn!(self.log, "failed to clone udp socket for registration"; "error" => %err);
                return false;
            }
        };

        let (slot, _entry) = self.flows.insert(key, socket, dst_addr, dst_port);

        if !self.registrations.offer(UdpRegistration {
            slot,
            socket: registration_copy,
            remote_addr: dst_addr,
            remote_port: dst_port,
            local_port: key.src_port,
        }) {
            warn!(self.log, "udp registration queue full, dropping new flow"; "slot" => slot);
            self.flows.remove(&key);
            return false;
        }

        if let Err(err) = self.wake.wake() {
            warn!(self.log, "failed to wake udp selector"; "error" => %err);
        }

        debug!(self.log, "opened udp flow"; "dst" => %dst);
        true
    }
}
