//! Wires the four worker loops and two selectors together behind a single
//! owned value. No process-wide statics: everything a running relay needs
//! — queues, selectors, byte counters, thread handles — lives in a
//! `RelayEngine` created by `start` and torn down by `stop`.

use crate::egress::EgressWriter;
use crate::ingress::IngressReader;
use crate::packet::Packet;
use crate::protect::ProtectFn;
use crate::queue;
use crate::tcp::TcpRelayLoop;
use crate::tun::TunDevice;
use crate::udp::{UdpReceiveLoop, UdpRegistration, UdpSendLoop};
use relay_support::config::RelayConfig;
use relay_support::logging::Logger;
use slog::{info, o, warn};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A running relay: five OS threads (Ingress Reader, UDP send, UDP
/// receive, TCP Relay, Egress Writer) connected by the bounded queues
/// described in the data model, plus the UDP selector's wakeup handle
/// needed to unblock it on `stop`.
pub struct RelayEngine {
    running: Arc<AtomicBool>,
    udp_wake: Arc<mio::Waker>,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
    log: Logger,
}

impl RelayEngine {
    /// Spawns every worker thread and returns once they're all running.
    /// `protect` is invoked on every upstream socket the engine opens,
    /// before `connect`. `config` supplies queue capacity, scratch buffer
    /// sizing, the TCP relay's idle poll interval, and the device-side
    /// IPv4 address reply packets are addressed to.
    pub fn start(tun: Arc<dyn TunDevice>, protect: ProtectFn, config: RelayConfig, log: Logger) -> io::Result<RelayEngine> {
        let capacity = config.queues.capacity;
        let device_addr = config.tuning.device_addr;
        let tcp_poll_interval = Duration::from_millis(config.tuning.tcp_poll_interval_millis);

        let (udp_ingress_tx, udp_ingress_rx) = queue::bounded::<Packet>(capacity);
        let (tcp_ingress_tx, tcp_ingress_rx) = queue::bounded::<Packet>(capacity);
        let (egress_tx, egress_rx) = queue::bounded::<Packet>(capacity);
        let (registration_tx, registration_rx) = queue::bounded::<UdpRegistration>(capacity);

        let running = Arc::new(AtomicBool::new(true));
        let bytes_in = Arc::new(AtomicU64::new(0));
        let bytes_out = Arc::new(AtomicU64::new(0));

        let mut udp_recv = UdpReceiveLoop::new(
            registration_rx,
            egress_tx.clone(),
            device_addr,
            log.new(o!("worker" => "udp-recv")),
        )?;
        let udp_wake = udp_recv.waker();

        let udp_send = UdpSendLoop::new(
            protect.clone(),
            udp_ingress_rx,
            registration_tx,
            udp_wake.clone(),
            log.new(o!("worker" => "udp-send")),
        );

        let tcp_relay = TcpRelayLoop::new(
            protect.clone(),
            tcp_ingress_rx,
            egress_tx,
            device_addr,
            log.new(o!("worker" => "tcp")),
        )?;

        let ingress = IngressReader::new(
            tun.clone(),
            udp_ingress_tx,
            tcp_ingress_tx,
            running.clone(),
            bytes_in.clone(),
            config.tuning.read_buffer_size,
            log.new(o!("worker" => "ingress")),
        );

        let egress = EgressWriter::new(tun, egress_rx, bytes_out.clone(), log.new(o!("worker" => "egress")));

        let handles = spawn_workers(ingress, udp_send, udp_recv, tcp_relay, egress, running.clone(), tcp_poll_interval, &log)?;

        info!(log, "relay engine started"; "queue_capacity" => capacity);

        Ok(RelayEngine {
            running,
            udp_wake,
            bytes_in,
            bytes_out,
            handles,
            log,
        })
    }

    /// Signals every worker to stop at its next suspension point, wakes
    /// the UDP selector (which would otherwise block indefinitely), and
    /// joins all five threads. Every owned socket and file descriptor is
    /// released as its owning worker's stack unwinds.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);

        if let Err(err) = self.udp_wake.wake() {
            warn!(self.log, "failed to wake udp selector during shutdown"; "error" => %err);
        }

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }

        info!(self.log, "relay engine stopped"; "bytes_in" => self.bytes_in.load(Ordering::Relaxed), "bytes_out" => self.bytes_out.load(Ordering::Relaxed));
    }

    /// Total bytes read off the virtual interface so far. Monotonic,
    /// eventually consistent with the Ingress Reader thread.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Total bytes written to the virtual interface so far. Monotonic,
    /// eventually consistent with the Egress Writer thread.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_workers(
    mut ingress: IngressReader,
    mut udp_send: UdpSendLoop,
    mut udp_recv: UdpReceiveLoop,
    mut tcp_relay: TcpRelayLoop,
    mut egress: EgressWriter,
    running: Arc<AtomicBool>,
    tcp_poll_interval: Duration,
    log: &Logger,
) -> io::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(5);

    handles.push(thread::Builder::new().name("relay-ingress".into()).spawn(move || ingress.run())?);

    handles.push(thread::Builder::new().name("relay-udp".into()).spawn(move || udp_send.run())?);

    let udp_recv_running = running.clone();
    let udp_recv_log = log.new(o!("worker" => "udp-recv"));
    handles.push(
        thread::Builder::new()
            .name("relay-udp-recv".into())
            .spawn(move || {
                while udp_recv_running.load(Ordering::Relaxed) {
                    if let Err(err) = udp_recv.tick() {
                        warn!(udp_recv_log, "udp selector tick failed, stopping"; "error" => %err);
                        break;
                    }
                }
            })?,
    );

    let tcp_running = running.clone();
    handles.push(
        thread::Builder::new()
            .name("relay-tcp".into())
            .spawn(move || {
                while tcp_running.load(Ordering::Relaxed) {
                    if !tcp_relay.tick() {
                        thread::sleep(tcp_poll_interval);
                    }
                }
            })?,
    );

    handles.push(thread::Builder::new().name("relay-egress".into()).spawn(move || egress.run())?);

    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::noop_protect;
    use crate::tun::test_support::LoopbackTun;
    use std::thread::sleep;

    #[test]
    fn start_and_stop_tear_down_cleanly() {
        let tun: Arc<dyn TunDevice> = Arc::new(LoopbackTun::new());
        let config = RelayConfig::default();

        let engine = RelayEngine::start(tun, noop_protect(), config, relay_support::logging::discard()).unwrap();

        sleep(Duration::from_millis(20));

        assert_eq!(engine.bytes_in(), 0);
        assert_eq!(engine.bytes_out(), 0);

        engine.stop();
    }
}
