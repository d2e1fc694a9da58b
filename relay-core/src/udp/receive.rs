use super::flow_table::UdpFlowEntry;
use super::UdpRegistration;
use crate::codec;
use crate::flow::SlotId;
use crate::packet::Packet;
use crate::queue::{QueueReceiver, QueueSender};
use relay_support::error::RelayError;
use relay_support::logging::Logger;
use slog::{debug, warn};
use std::io;
use std::sync::Arc;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Reserved token for the wakeup registration. Flow slots are allocated
/// from 0 upward and never reach this value in practice.
const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

/// Blocks on the UDP selector, registering newly handed-off sockets first.
/// Runs on its own thread (`relay-udp-recv`).
pub struct UdpReceiveLoop {
    poll: mio::Poll,
    events: mio::Events,
    slots: Vec<Option<(mio::net::UdpSocket, UdpFlowEntry)>>,
    registrations: QueueReceiver<UdpRegistration>,
    egress: QueueSender<Packet>,
    next_ip_id: u16,
    scratch: [u8; READ_BUF_SIZE],
    device_addr: std::net::Ipv4Addr,
    waker: Arc<mio::Waker>,
    log: Logger,
}

impl UdpReceiveLoop {
    pub fn new(
        registrations: QueueReceiver<UdpRegistration>,
        egress: QueueSender<Packet>,
        device_addr: std::net::Ipv4Addr,
        log: Logger,
    ) -> io::Result<UdpReceiveLoop> {
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);

        Ok(UdpReceiveLoop {
            poll,
            events: mio::Events::with_capacity(1024),
            slots: Vec::new(),
            registrations,
            egress,
            next_ip_id: 0,
            scratch: [0; READ_BUF_SIZE],
            device_addr,
            waker,
            log,
        })
    }

    /// The wakeup handle the send loop uses to interrupt this loop's
    /// blocking selector wait whenever it hands off a freshly opened
    /// socket, and the engine uses to unblock it during shutdown.
    pub fn waker(&self) -> Arc<mio::Waker> {
        self.waker.clone()
    }

    /// Registers pending flows, then blocks on the selector until a socket
    /// is ready or a wakeup arrives, and drains every readable socket.
    /// Intended to be called in a loop by the owning thread.
    pub fn tick(&mut self) -> io::Result<()> {
        self.drain_registrations();

        self.poll.poll(&mut self.events, None)?;

        let ready: Vec<SlotId> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKE_TOKEN)
            .map(|event| event.token().0)
            .collect();

        for slot in ready {
            self.service(slot);
        }

        Ok(())
    }

    fn drain_registrations(&mut self) {
        let poll = &self.poll;
        let slots = &mut self.slots;
        let log = &self.log;

        self.registrations.drain(1024, |reg| {
            let UdpRegistration {
                slot,
                socket,
                remote_addr,
                remote_port,
                local_port,
            } = reg;
            let mut mio_socket = mio::net::UdpSocket::from_std(socket);

            if let Err(err) = poll
                .registry()
                .register(&mut mio_socket, mio::Token(slot), mio::Interest::READABLE)
            {
                warn!(log, "failed to register udp socket with selector"; "error" => %err);
                return;
            }

            while slots.len() <= slot {
                slots.push(None);
            }

            let entry = UdpFlowEntry {
                remote_addr,
                remote_port,
                local_port,
                slot,
            };

            slots[slot] = Some((mio_socket, entry));
        });
    }

    fn service(&mut self, slot: SlotId) {
        let (local_port, remote_addr, remote_port) = {
            let Some((_, entry)) = self.slots.get(slot).and_then(|s| s.as_ref()) else {
                return;
            };
            (entry.local_port, entry.remote_addr, entry.remote_port)
        };

        loop {
            let read = {
                let Some((socket, _)) = self.slots[slot].as_mut() else {
                    return;
                };
                socket.recv(&mut self.scratch)
            };

            let n = match read {
                Ok(n) => n,
                Err(err) if RelayError::from(io::Error::from(err.kind())) == RelayError::Wait => break,
                Err(err) => {
                    debug!(self.log, "udp upstream read failed, evicting flow"; "slot" => slot, "error" => %err);
                    self.evict(slot);
                    break;
                }
            };

            if n == 0 {
                break;
            }

            self.emit_reply(remote_addr, remote_port, local_port, &self.scratch[..n].to_vec());
        }
    }

    fn emit_reply(&mut self, remote_addr: std::net::Ipv4Addr, remote_port: u16, local_port: u16, payload: &[u8]) {
        let ip_id = self.next_ip_id;
        self.next_ip_id = self.next_ip_id.wrapping_add(1);

        match codec::build_udp_reply(remote_addr, remote_port, self.device_addr, local_port, ip_id, payload) {
            Ok(bytes) => {
                if !self.egress.offer(Packet::new(bytes)) {
                    debug!(self.log, "egress queue full, dropping udp reply");
                }
            }
            Err(err) => warn!(self.log, "failed to build udp reply"; "error" => err.0),
        }
    }

    /// Deregisters and drops the socket at `slot`, leaving a hole this
    /// loop never refills on its own: `UdpFlowTable`'s free-list is what
    /// hands the same slot id back out to a future flow (see
    /// `drain_registrations`, which just overwrites whatever was there).
    fn evict(&mut self, slot: SlotId) {
        if let Some((mut socket, _)) = self.slots[slot].take() {
            let _ = self.poll.registry().deregister(&mut socket);
        }
    }
}
