use crate::buffer::Buffer;
use crate::flow::TcpFlowKey;
use mio::net::TcpStream;

const REMOTE_OUT_BUFFER_SIZE: usize = 64 * 1024;

/// Lifecycle state of a single TCP pipe, mirroring the subset of RFC 793
/// states this engine actually needs to model (no LISTEN, no TIME_WAIT —
/// the device side is always the one dialing in).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TcpStatus {
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    Closed,
}

/// The per-flow TCP termination state: one upstream stream socket plus the
/// sequence/acknowledgement bookkeeping needed to keep the device's view of
/// the connection consistent with what we actually forward upstream.
pub struct TcpPipe {
    pub key: TcpFlowKey,
    pub stream: TcpStream,
    pub connected: bool,
    /// Unix timestamp at which the upstream `connect` finished, stamped
    /// once the selector reports the socket writable for the first time.
    /// Zero until then.
    pub connected_at: u64,
    pub interest: mio::Interest,

    pub my_sequence_num: u32,
    pub their_sequence_num: u32,
    pub my_ack_num: u32,
    pub their_ack_num: u32,

    pub status: TcpStatus,
    pub up_active: bool,
    pub down_active: bool,

    pub remote_out_buffer: Buffer,

    pub pack_id: u16,
    pub syn_count: u32,
    pub tunnel_id: u64,
}

impl TcpPipe {
    pub fn new(key: TcpFlowKey, stream: TcpStream, tunnel_id: u64) -> TcpPipe {
        TcpPipe {
            key,
            stream,
            connected: false,
            connected_at: 0,
            interest: mio::Interest::WRITABLE,
            my_sequence_num: 0,
            their_sequence_num: 0,
            my_ack_num: 0,
            their_ack_num: 0,
            status: TcpStatus::SynSent,
            up_active: true,
            down_active: true,
            remote_out_buffer: Buffer::new(REMOTE_OUT_BUFFER_SIZE),
            pack_id: 0,
            syn_count: 0,
            tunnel_id,
        }
    }

    /// Next IP identification value to stamp on a reply packet.
    #[inline]
    pub fn next_pack_id(&mut self) -> u16 {
        let id = self.pack_id;
        self.pack_id = self.pack_id.wrapping_add(1);
        id
    }

    /// Applies the sequence/ack bookkeeping rule that every emitted segment
    /// is subject to: SYN and FIN each consume one sequence number, a
    /// data-bearing ACK consumes `payload_len`. Applied once per segment
    /// regardless of how many flags are set together.
    #[inline]
    pub fn account_emitted(&mut self, syn: bool, fin: bool, payload_len: usize) {
        if syn {
            self.my_sequence_num = self.my_sequence_num.wrapping_add(1);
        }
        if fin {
            self.my_sequence_num = self.my_sequence_num.wrapping_add(1);
        }
        if payload_len > 0 {
            self.my_sequence_num = self.my_sequence_num.wrapping_add(payload_len as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::noop_protect;
    use crate::socket;
    use std::net::{Ipv4Addr, TcpListener};

    fn test_pipe() -> TcpPipe {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let key = TcpFlowKey::new(Ipv4Addr::new(93, 184, 216, 34), 80, 5555);
        let stream = socket::connect_tcp(&noop_protect(), addr).unwrap();
        TcpPipe::new(key, stream, 1)
    }

    #[test]
    fn new_pipe_starts_in_syn_sent_with_writable_interest() {
        let pipe = test_pipe();
        assert_eq!(pipe.status, TcpStatus::SynSent);
        assert!(!pipe.connected);
        assert!(pipe.up_active);
        assert!(pipe.down_active);
        assert_eq!(pipe.interest, mio::Interest::WRITABLE);
        assert_eq!(pipe.my_sequence_num, 0);
        assert_eq!(pipe.pack_id, 0);
    }

    #[test]
    fn next_pack_id_increments_and_wraps() {
        let mut pipe = test_pipe();
        assert_eq!(pipe.next_pack_id(), 0);
        assert_eq!(pipe.next_pack_id(), 1);

        pipe.pack_id = u16::MAX;
        assert_eq!(pipe.next_pack_id(), u16::MAX);
        assert_eq!(pipe.pack_id, 0);
    }

    #[test]
    fn account_emitted_advances_sequence_by_syn_fin_and_payload() {
        let mut pipe = test_pipe();

        // SYN consumes exactly one sequence number, regardless of payload.
        pipe.account_emitted(true, false, 0);
        assert_eq!(pipe.my_sequence_num, 1);

        // A data-bearing ACK consumes one number per byte of payload.
        pipe.account_emitted(false, false, 200);
        assert_eq!(pipe.my_sequence_num, 201);

        // FIN likewise consumes exactly one, even combined with a payload.
        pipe.account_emitted(true, true, 3);
        assert_eq!(pipe.my_sequence_num, 206);
    }

    #[test]
    fn account_emitted_wraps_past_u32_max() {
        let mut pipe = test_pipe();
        pipe.my_sequence_num = u32::MAX;
        pipe.account_emitted(true, false, 0);
        assert_eq!(pipe.my_sequence_num, 0);
    }
}
