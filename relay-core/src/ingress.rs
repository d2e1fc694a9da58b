//! Reads raw IPv4 datagrams off the virtual interface, classifies them by
//! transport protocol, and fans them out onto the UDP-ingress / TCP-ingress
//! queues. Runs on its own thread (`relay-ingress`).

use crate::codec::{self, ParsedIpv4};
use crate::packet::Packet;
use crate::queue::QueueSender;
use crate::tun::TunDevice;
use relay_support::logging::Logger;
use slog::{debug, warn};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Fallback scratch buffer size if a caller hands us a degenerate config
/// value (0 would make every read a zero-length no-op).
const DEFAULT_READ_BUF_SIZE: usize = 16 * 1024;

pub struct IngressReader {
    tun: Arc<dyn TunDevice>,
    udp_ingress: QueueSender<Packet>,
    tcp_ingress: QueueSender<Packet>,
    running: Arc<AtomicBool>,
    bytes_read: Arc<AtomicU64>,
    read_buf_size: usize,
    log: Logger,
}

impl IngressReader {
    pub fn new(
        tun: Arc<dyn TunDevice>,
        udp_ingress: QueueSender<Packet>,
        tcp_ingress: QueueSender<Packet>,
        running: Arc<AtomicBool>,
        bytes_read: Arc<AtomicU64>,
        read_buf_size: usize,
        log: Logger,
    ) -> IngressReader {
        IngressReader {
            tun,
            udp_ingress,
            tcp_ingress,
            running,
            bytes_read,
            read_buf_size: if read_buf_size == 0 { DEFAULT_READ_BUF_SIZE } else { read_buf_size },
            log,
        }
    }

    /// Reads and dispatches packets until `running` is cleared or the
    /// virtual interface reports a terminal error.
    pub fn run(&mut self) {
        let mut scratch = vec![0u8; self.read_buf_size];

        while self.running.load(Ordering::Relaxed) {
            match self.tun.recv_packet(&mut scratch) {
                Ok(n) => {
                    self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    self.dispatch(&scratch[..n]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(self.log, "tun read failed, stopping ingress reader"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, data: &[u8]) {
        match codec::parse_ipv4(data) {
            Ok(ParsedIpv4::Udp(_)) => {
                if !self.udp_ingress.offer(Packet::from_slice(data)) {
                    debug!(self.log, "udp-ingress queue full, dropping packet");
                }
            }
            Ok(ParsedIpv4::Tcp(_)) => {
                if !self.tcp_ingress.offer(Packet::from_slice(data)) {
                    debug!(self.log, "tcp-ingress queue full, dropping packet");
                }
            }
            Ok(ParsedIpv4::Other(proto)) => {
                debug!(self.log, "discarding non-udp/tcp packet"; "protocol" => proto);
            }
            Err(err) => {
                debug!(self.log, "dropping malformed packet"; "reason" => err.0);
            }
        }
    }
}
