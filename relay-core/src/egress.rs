//! Serializes reply packets from the shared egress queue to the virtual
//! interface, in the order they were enqueued. Runs on its own thread
//! (`relay-egress`).

use crate::packet::Packet;
use crate::queue::QueueReceiver;
use crate::tun::TunDevice;
use relay_support::logging::Logger;
use slog::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct EgressWriter {
    tun: Arc<dyn TunDevice>,
    egress: QueueReceiver<Packet>,
    bytes_written: Arc<AtomicU64>,
    log: Logger,
}

impl EgressWriter {
    pub fn new(tun: Arc<dyn TunDevice>, egress: QueueReceiver<Packet>, bytes_written: Arc<AtomicU64>, log: Logger) -> EgressWriter {
        EgressWriter {
            tun,
            egress,
            bytes_written,
            log,
        }
    }

    /// Blocks on the egress queue and writes each packet fully before
    /// dequeuing the next one. Returns once every producer has
    /// disconnected, which happens only during engine teardown.
    pub fn run(&mut self) {
        while let Some(packet) = self.egress.recv_blocking() {
            self.write_fully(packet.as_slice());
        }
    }

    fn write_fully(&mut self, buf: &[u8]) {
        match self.tun.send_packet(buf) {
            Ok(n) => {
                self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(self.log, "tun write failed, dropping reply packet"; "error" => %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use crate::tun::test_support::LoopbackTun;

    #[test]
    fn writes_packets_in_enqueue_order_and_counts_bytes() {
        let tun = Arc::new(LoopbackTun::new());
        let (tx, rx) = queue::bounded::<Packet>(4);
        let bytes_written = Arc::new(AtomicU64::new(0));

        tx.offer(Packet::new(vec![1, 2, 3]));
        tx.offer(Packet::new(vec![4, 5]));
        drop(tx);

        let mut writer = EgressWriter::new(tun.clone(), rx, bytes_written.clone(), relay_support::logging::discard());
        writer.run();

        let written = tun.take_outbound();
        assert_eq!(written, vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(bytes_written.load(Ordering::Relaxed), 5);
    }
}
