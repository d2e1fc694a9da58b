use super::pipe::{TcpPipe, TcpStatus};
use super::table::TcpPipeTable;
use crate::codec::{self, ParsedIpv4, TcpFlags};
use crate::flow::{SlotId, TcpFlowKey};
use crate::packet::Packet;
use crate::protect::ProtectFn;
use crate::queue::{QueueReceiver, QueueSender};
use crate::socket;
use etherparse::TcpHeaderSlice;
use relay_support::error::{RelayError, ResultExt};
use relay_support::logging::Logger;
use slog::{debug, trace, warn};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

const READ_BUF_SIZE: usize = 4 * 1024;
const WINDOW_SIZE: u16 = 65535;
const ZERO_TIME: Duration = Duration::from_secs(0);

/// Drives the TCP termination state machine. Alternates draining the
/// TCP-ingress queue (phase A) with servicing the TCP selector (phase B)
/// on its own thread (`relay-tcp`); never blocks on either, sleeping
/// between iterations only when both were idle.
pub struct TcpRelayLoop {
    table: TcpPipeTable,
    poll: mio::Poll,
    events: mio::Events,
    protect: ProtectFn,
    ingress: QueueReceiver<Packet>,
    egress: QueueSender<Packet>,
    device_addr: Ipv4Addr,
    scratch: [u8; READ_BUF_SIZE],
    next_tunnel_id: u64,
    log: Logger,
}

impl TcpRelayLoop {
    pub fn new(
        protect: ProtectFn,
        ingress: QueueReceiver<Packet>,
        egress: QueueSender<Packet>,
        device_addr: Ipv4Addr,
        log: Logger,
    ) -> io::Result<TcpRelayLoop> {
        Ok(TcpRelayLoop {
            table: TcpPipeTable::new(),
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(1024),
            protect,
            ingress,
            egress,
            device_addr,
            scratch: [0; READ_BUF_SIZE],
            next_tunnel_id: 0,
            log,
        })
    }

    /// Runs one phase A + phase B pass. Returns `true` if either phase did
    /// any work, so the caller can decide whether to sleep before the next
    /// iteration.
    pub fn tick(&mut self) -> bool {
        let drained = self.drain_ingress();
        let serviced = self.service_selector();
        drained > 0 || serviced > 0
    }

    // ---- Phase A: drain TCP-ingress -----------------------------------

    fn drain_ingress(&mut self) -> usize {
        let mut count = 0;
        while let Some(packet) = self.ingress.try_recv_one() {
            self.handle_packet(packet);
            count += 1;
        }
        count
    }

    fn handle_packet(&mut self, packet: Packet) {
        let parsed = match codec::parse_ipv4(packet.as_slice()) {
            Ok(ParsedIpv4::Tcp(tcp)) => tcp,
            Ok(_) => return,
            Err(err) => {
                debug!(self.log, "dropping malformed tcp packet"; "reason" => err.0);
                return;
            }
        };

        let key = TcpFlowKey::new(parsed.dst_addr, parsed.header.destination_port(), parsed.header.source_port());

        let slot = match self.table.get(&key) {
            Some(slot) => slot,
            None => match self.open_pipe(key, parsed.dst_addr, parsed.header.destination_port()) {
                Some(slot) => slot,
                None => return,
            },
        };

        self.dispatch(slot, key, &parsed.header, parsed.payload);
    }

    fn open_pipe(&mut self, key: TcpFlowKey, dst_addr: Ipv4Addr, dst_port: u16) -> Option<SlotId> {
        let dst = SocketAddr::new(dst_addr.into(), dst_port);

        let stream = match socket::connect_tcp(&self.protect, dst) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(self.log, "tcp connect failed"; "dst" => %dst, "error" => %err);
                return None;
            }
        };

        let tunnel_id = self.next_tunnel_id;
        self.next_tunnel_id += 1;

        let pipe = TcpPipe::new(key, stream, tunnel_id);
        let interest = pipe.interest;
        let slot = self.table.insert(key, pipe);

        if let Err(err) =
            self.poll
                .registry()
                .register(&mut self.table.pipe_mut(slot).unwrap().stream, mio::Token(slot), interest)
        {
            warn!(self.log, "failed to register tcp socket with selector"; "error" => %err);
            self.table.remove(&key);
            return None;
        }

        debug!(self.log, "opened tcp pipe"; "dst" => %dst, "tunnel_id" => tunnel_id);
        Some(slot)
    }

    fn dispatch(&mut self, slot: SlotId, key: TcpFlowKey, header: &TcpHeaderSlice<'_>, payload: &[u8]) {
        if header.rst() {
            self.on_rst(slot, key);
            return;
        }

        if header.syn() {
            self.on_syn(slot, header);
            return;
        }

        if header.fin() {
            self.on_fin(slot, key, header);
            return;
        }

        if header.ack() {
            self.on_ack(slot, header, payload);
        }
    }

    fn on_rst(&mut self, slot: SlotId, key: TcpFlowKey) {
        if let Some(pipe) = self.table.pipe_mut(slot) {
            pipe.up_active = false;
            pipe.down_active = false;
            pipe.status = TcpStatus::CloseWait;
        }
        self.purge(slot, &key);
    }

    fn on_syn(&mut self, slot: SlotId, header: &TcpHeaderSlice<'_>) {
        let Some(pipe) = self.table.pipe_mut(slot) else { return };

        pipe.syn_count += 1;

        if pipe.status == TcpStatus::SynSent {
            pipe.their_sequence_num = header.sequence_number();
            pipe.my_ack_num = header.sequence_number().wrapping_add(1);
            pipe.my_sequence_num = 1;
            pipe.status = TcpStatus::SynReceived;

            self.emit(
                slot,
                TcpFlags {
                    syn: true,
                    ack: true,
                    ..Default::default()
                },
                &[],
            );
        } else {
            // Retransmitted SYN: only the ack we'd reply with is refreshed,
            // sequence bookkeeping is left alone.
            pipe.my_ack_num = header.sequence_number().wrapping_add(1);
        }
    }

    fn on_fin(&mut self, slot: SlotId, key: TcpFlowKey, header: &TcpHeaderSlice<'_>) {
        {
            let Some(pipe) = self.table.pipe_mut(slot) else { return };
            pipe.my_ack_num = header.sequence_number().wrapping_add(1);
            pipe.their_ack_num = header.acknowledgment_number().wrapping_add(1);
        }

        self.emit(slot, TcpFlags { ack: true, ..Default::default() }, &[]);

        let Some(pipe) = self.table.pipe_mut(slot) else { return };
        let _ = pipe.stream.shutdown(std::net::Shutdown::Write);
        pipe.status = TcpStatus::CloseWait;
        pipe.up_active = false;

        if !pipe.down_active {
            self.purge(slot, &key);
        }
    }

    fn on_ack(&mut self, slot: SlotId, header: &TcpHeaderSlice<'_>, payload: &[u8]) {
        let Some(pipe) = self.table.pipe_mut(slot) else { return };

        if pipe.status == TcpStatus::SynReceived {
            pipe.status = TcpStatus::Established;
        }

        if payload.is_empty() {
            return;
        }

        let seg_end = header.sequence_number().wrapping_add(payload.len() as u32);
        if !seq_gt(seg_end, pipe.my_ack_num) {
            // Duplicate: already accounted for, drop silently.
            return;
        }

        pipe.my_ack_num = seg_end;
        pipe.remote_out_buffer.push(payload);

        let stream = &mut pipe.stream;
        if pipe.remote_out_buffer.egress(stream).has_failed() {
            self.close_rst(slot);
            return;
        }

        if !pipe.remote_out_buffer.is_empty() {
            pipe.interest = pipe.interest.add(mio::Interest::WRITABLE);
            let _ = self.poll.registry().reregister(&mut pipe.stream, mio::Token(slot), pipe.interest);
        }

        self.emit(slot, TcpFlags { ack: true, ..Default::default() }, &[]);
    }

    // ---- Phase B: service the TCP selector ----------------------------

    fn service_selector(&mut self) -> usize {
        if let Err(err) = self.poll.poll(&mut self.events, Some(ZERO_TIME)) {
            warn!(self.log, "tcp selector poll failed"; "error" => %err);
            return 0;
        }

        let ready: Vec<(SlotId, bool, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token().0, event.is_writable(), event.is_readable(), event.is_error()))
            .collect();

        let count = ready.len();

        for (slot, writable, readable, errored) in ready {
            if errored {
                self.close_rst(slot);
                continue;
            }

            let connecting = self.table.pipe(slot).map(|p| !p.connected).unwrap_or(false);

            if connecting {
                self.on_connectable(slot);
                continue;
            }

            if readable {
                self.on_readable(slot);
            }
            if writable {
                self.on_writable(slot);
            }
        }

        count
    }

    fn on_connectable(&mut self, slot: SlotId) {
        let Some(pipe) = self.table.pipe_mut(slot) else { return };

        match pipe.stream.take_error() {
            Ok(None) => {}
            _ => {
                self.close_rst(slot);
                return;
            }
        }

        pipe.connected = true;
        pipe.connected_at = relay_support::time::timestamp_secs();
        pipe.interest = mio::Interest::READABLE | mio::Interest::WRITABLE;
        let _ = self.poll.registry().reregister(&mut pipe.stream, mio::Token(slot), pipe.interest);
    }

    fn on_readable(&mut self, slot: SlotId) {
        loop {
            let status = match self.table.pipe(slot) {
                Some(pipe) => pipe.status,
                None => return,
            };

            let read = {
                let Some(pipe) = self.table.pipe_mut(slot) else { return };
                pipe.stream.read(&mut self.scratch)
            };

            match read {
                Ok(0) => {
                    self.on_upstream_eof(slot);
                    return;
                }
                Ok(n) => {
                    if status != TcpStatus::CloseWait {
                        let chunk = self.scratch[..n].to_vec();
                        self.emit(slot, TcpFlags { ack: true, ..Default::default() }, &chunk);
                    }
                }
                Err(err) if RelayError::from(io::Error::from(err.kind())) == RelayError::Wait => return,
                Err(_) => {
                    self.close_rst(slot);
                    return;
                }
            }
        }
    }

    fn on_upstream_eof(&mut self, slot: SlotId) {
        {
            let Some(pipe) = self.table.pipe_mut(slot) else { return };
            pipe.interest = pipe
                .interest
                .remove(mio::Interest::READABLE)
                .unwrap_or(mio::Interest::WRITABLE);
            let _ = self.poll.registry().reregister(&mut pipe.stream, mio::Token(slot), pipe.interest);
        }

        self.emit(slot, TcpFlags { fin: true, ack: true, ..Default::default() }, &[]);

        let key = match self.table.pipe(slot) {
            Some(pipe) => pipe.key,
            None => return,
        };

        let should_purge = {
            let Some(pipe) = self.table.pipe_mut(slot) else { return };
            pipe.down_active = false;
            !pipe.up_active
        };

        if should_purge {
            self.purge(slot, &key);
        }
    }

    fn on_writable(&mut self, slot: SlotId) {
        let Some(pipe) = self.table.pipe_mut(slot) else { return };

        if pipe.remote_out_buffer.is_empty() {
            pipe.interest = mio::Interest::READABLE;
            let _ = self.poll.registry().reregister(&mut pipe.stream, mio::Token(slot), pipe.interest);
            return;
        }

        let stream = &mut pipe.stream;
        match pipe.remote_out_buffer.egress(stream) {
            Ok(_) => {}
            Err(RelayError::Wait) => return,
            Err(_) => {
                self.close_rst(slot);
                return;
            }
        }

        if pipe.remote_out_buffer.is_empty() {
            pipe.interest = mio::Interest::READABLE;
            let _ = self.poll.registry().reregister(&mut pipe.stream, mio::Token(slot), pipe.interest);
        }
    }

    // ---- shared helpers -------------------------------------------------

    /// Emits a reply segment, applying the sequence accounting rule once,
    /// after the segment is built so the emitted seq matches the invariant
    /// ("equals mySequenceNum at the moment of emission, prior to the
    /// post-emission adjustment").
    fn emit(&mut self, slot: SlotId, flags: TcpFlags, payload: &[u8]) {
        let Some(pipe) = self.table.pipe_mut(slot) else { return };

        let ip_id = pipe.next_pack_id();
        let seq = pipe.my_sequence_num;
        let ack = pipe.my_ack_num;

        let built = codec::build_tcp_reply(
            pipe.key.dst_addr,
            pipe.key.dst_port,
            self.device_addr,
            pipe.key.src_port,
            seq,
            ack,
            WINDOW_SIZE,
            flags,
            ip_id,
            payload,
        );

        pipe.account_emitted(flags.syn, flags.fin, payload.len());

        match built {
            Ok(bytes) => {
                if !self.egress.offer(Packet::new(bytes)) {
                    debug!(self.log, "egress queue full, dropping tcp reply"; "slot" => slot);
                }
            }
            Err(err) => warn!(self.log, "failed to build tcp reply"; "error" => err.0),
        }
    }

    fn close_rst(&mut self, slot: SlotId) {
        let key = match self.table.pipe(slot) {
            Some(pipe) => pipe.key,
            None => return,
        };

        self.emit(slot, TcpFlags { rst: true, ..Default::default() }, &[]);
        self.purge(slot, &key);
    }

    /// Removes the pipe from the flow table before anything else, per the
    /// purge-then-lookup invariant, then tears down its OS resources.
    fn purge(&mut self, slot: SlotId, key: &TcpFlowKey) {
        if let Some(mut pipe) = self.table.remove(key) {
            let _ = self.poll.registry().deregister(&mut pipe.stream);
            trace!(self.log, "purged tcp pipe"; "slot" => slot, "tunnel_id" => pipe.tunnel_id);
        }
    }
}

/// Sequence-number comparison modulo 2^32 (RFC 1323 "SEQ_LT"-style): `a` is
/// considered strictly ahead of `b` if the signed difference is positive.
#[inline]
fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::noop_protect;
    use crate::queue;
    use std::net::TcpListener;

    fn make_loop() -> (TcpRelayLoop, QueueSender<Packet>, QueueReceiver<Packet>) {
        let (ingress_tx, ingress_rx) = queue::bounded::<Packet>(16);
        let (egress_tx, egress_rx) = queue::bounded::<Packet>(16);
        let relay = TcpRelayLoop::new(
            noop_protect(),
            ingress_rx,
            egress_tx,
            Ipv4Addr::new(10, 0, 0, 2),
            relay_support::logging::discard(),
        )
        .unwrap();
        (relay, ingress_tx, egress_rx)
    }

    fn loopback_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn syn_handshake_emits_syn_ack_with_expected_numbers() {
        let (listener, addr) = loopback_listener();
        let (mut relay, ingress_tx, egress_rx) = make_loop();

        let dst_addr = match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        // The device-side SYN targets the listener's own address so the
        // flow key's destination matches what the relay connects to.
        let syn = codec::build_tcp_reply(
            Ipv4Addr::new(10, 0, 0, 2),
            51000,
            dst_addr,
            addr.port(),
            1000,
            0,
            WINDOW_SIZE,
            TcpFlags {
                syn: true,
                ..Default::default()
            },
            0,
            &[],
        )
        .unwrap();

        ingress_tx.offer(Packet::new(syn));
        relay.tick();
        let _ = listener.accept();

        let reply = egress_rx.try_recv_one().expect("syn+ack emitted");
        match codec::parse_ipv4(reply.as_slice()).unwrap() {
            ParsedIpv4::Tcp(tcp) => {
                assert!(tcp.header.syn());
                assert!(tcp.header.ack());
                assert_eq!(tcp.header.sequence_number(), 1);
                assert_eq!(tcp.header.acknowledgment_number(), 1001);
            }
            _ => panic!("expected tcp"),
        }
    }

    #[test]
    fn seq_gt_handles_wraparound() {
        assert!(seq_gt(5, u32::MAX - 2));
        assert!(!seq_gt(u32::MAX - 2, 5));
        assert!(!seq_gt(10, 10));
    }
}
