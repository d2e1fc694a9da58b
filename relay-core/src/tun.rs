use std::io;
use std::os::unix::io::RawFd;

/// The virtual network interface the engine reads IPv4 datagrams from and
/// writes reply datagrams to. Acquiring the underlying file descriptor
/// (opening `/dev/net/tun`, the ioctl dance, permission prompts on mobile
/// platforms) is out of scope — callers hand the engine an already-open
/// device.
pub trait TunDevice: Send + Sync {
    /// Reads a single datagram, preserving its boundary (one `recv_packet`
    /// call yields exactly one IPv4 datagram, never a partial or coalesced
    /// read).
    fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes a single datagram.
    fn send_packet(&self, buf: &[u8]) -> io::Result<usize>;

    /// The raw descriptor backing this device, for callers that need to
    /// register it with a poller.
    fn raw_fd(&self) -> RawFd;
}

/// Wraps an already-open TUN file descriptor. Production callers construct
/// this from whatever platform-specific mechanism handed them the fd; this
/// type itself does no acquisition.
pub struct RawFdTunDevice {
    fd: RawFd,
}

impl RawFdTunDevice {
    /// # Safety
    /// `fd` must be a valid, open file descriptor for a TUN device in
    /// packet-boundary-preserving mode, and the caller must not close it
    /// while this `RawFdTunDevice` is alive.
    pub unsafe fn from_raw_fd(fd: RawFd) -> RawFdTunDevice {
        RawFdTunDevice { fd }
    }
}

impl TunDevice for RawFdTunDevice {
    fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc_read(self.fd, buf.as_mut_ptr(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn send_packet(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc_write(self.fd, buf.as_ptr(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

// Minimal extern declarations rather than pulling in the whole of `libc`
// for two syscalls; the crate already reaches for real dependencies
// everywhere the engine needs more than this.
extern "C" {
    #[link_name = "read"]
    fn libc_read(fd: RawFd, buf: *mut u8, count: usize) -> isize;
    #[link_name = "write"]
    fn libc_write(fd: RawFd, buf: *const u8, count: usize) -> isize;
}

/// An in-memory `TunDevice` double, enabled by default so both this
/// crate's own unit tests and `tests/` integration suites can drive a
/// `RelayEngine` end to end without a real TUN device.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// An in-memory `TunDevice` double: datagrams queued via `push_inbound`
    /// are returned by `recv_packet`; datagrams written via `send_packet`
    /// are captured for assertions.
    #[derive(Default)]
    pub struct LoopbackTun {
        inbound: Mutex<VecDeque<Vec<u8>>>,
        outbound: Mutex<Vec<Vec<u8>>>,
    }

    impl LoopbackTun {
        pub fn new() -> LoopbackTun {
            LoopbackTun::default()
        }

        pub fn push_inbound(&self, packet: Vec<u8>) {
            self.inbound.lock().unwrap().push_back(packet);
        }

        pub fn take_outbound(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.outbound.lock().unwrap())
        }
    }

    impl TunDevice for LoopbackTun {
        fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inbound.lock().unwrap().pop_front() {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn send_packet(&self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        fn raw_fd(&self) -> RawFd {
            -1
        }
    }
}
