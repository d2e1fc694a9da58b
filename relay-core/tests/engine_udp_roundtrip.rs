//! End-to-end UDP round trip through a real `RelayEngine`: a synthetic
//! device-side datagram goes in one side of an in-memory `TunDevice`, a
//! genuine loopback UDP socket stands in for the real destination, and
//! the reply that comes back out the other side of the tunnel is checked
//! against what the device originally sent to.

use relay_core::codec::{self, ParsedIpv4};
use relay_core::protect::noop_protect;
use relay_core::tun::test_support::LoopbackTun;
use relay_core::{RelayEngine, TunDevice};
use relay_support::config::RelayConfig;
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn poll_outbound(tun: &LoopbackTun, attempts: usize) -> Vec<Vec<u8>> {
    for _ in 0..attempts {
        let outbound = tun.take_outbound();
        if !outbound.is_empty() {
            return outbound;
        }
        thread::sleep(Duration::from_millis(10));
    }
    Vec::new()
}

#[test]
fn udp_datagram_is_relayed_and_reply_comes_back() {
    let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
    echo.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let echo_addr = echo.local_addr().unwrap();
    let echo_ip = match echo_addr.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => unreachable!("bound to an IPv4 loopback address"),
    };

    let echo_thread = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (n, peer) = echo.recv_from(&mut buf).expect("echo server receives a datagram");
        assert_eq!(&buf[..n], &[0xAA, 0xBB]);
        echo.send_to(&[0xCC, 0xDD], peer).expect("echo server replies");
    });

    let tun = Arc::new(LoopbackTun::new());
    let tun_handle: Arc<dyn TunDevice> = tun.clone();
    let config = RelayConfig::default();
    let device_addr = config.tuning.device_addr;

    let engine = RelayEngine::start(tun_handle, noop_protect(), config, relay_support::logging::discard()).unwrap();

    let device_packet = codec::build_udp_reply(device_addr, 40000, echo_ip, echo_addr.port(), 1, &[0xAA, 0xBB]).unwrap();
    tun.push_inbound(device_packet);

    let outbound = poll_outbound(&tun, 200);
    engine.stop();
    echo_thread.join().unwrap();

    assert_eq!(outbound.len(), 1, "expected exactly one egress packet");

    match codec::parse_ipv4(&outbound[0]).unwrap() {
        ParsedIpv4::Udp(udp) => {
            assert_eq!(udp.src_addr, echo_ip);
            assert_eq!(udp.dst_addr, device_addr);
            assert_eq!(udp.header.source_port(), echo_addr.port());
            assert_eq!(udp.header.destination_port(), 40000);
            assert_eq!(udp.payload, &[0xCC, 0xDD]);
        }
        _ => panic!("expected a udp reply packet"),
    }
}
