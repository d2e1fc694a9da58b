//! Helpers for opening the upstream sockets the relays terminate flows on:
//! create, protect, set non-blocking, then hand off to `mio`.

use crate::protect::ProtectFn;
use relay_support::error::RelayError;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

/// Opens a non-blocking UDP socket, protects it, and connects it to
/// `dst`. A connected datagram socket lets the relay use plain `send`/`recv`
/// instead of tracking the peer address on every datagram.
///
/// Returns a plain `std::net::UdpSocket` rather than an `mio`-wrapped one:
/// the UDP relay's send loop and receive loop are separate threads, and the
/// send loop keeps this handle for writing while a `try_clone` of it is
/// handed to the receive loop's selector over the registration queue.
pub fn connect_udp(protect: &ProtectFn, dst: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(dst), Type::DGRAM, None)?;
    socket.set_nonblocking(true)?;
    protect(socket.as_raw_fd())?;
    socket.connect(&dst.into())?;

    Ok(socket.into())
}

/// Opens a non-blocking TCP socket, protects it, and begins an
/// asynchronous `connect` to `dst`. The connection is very likely still in
/// progress when this returns; callers register the stream for write
/// readiness to learn when it completes.
pub fn connect_tcp(protect: &ProtectFn, dst: SocketAddr) -> io::Result<mio::net::TcpStream> {
    let socket = Socket::new(Domain::for_address(dst), Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    protect(socket.as_raw_fd())?;

    match socket.connect(&dst.into()) {
        Ok(()) => {}
        // EINPROGRESS surfaces as a raw os error on some platforms rather
        // than WouldBlock.
        Err(err) if err.raw_os_error() == Some(libc_einprogress()) => {}
        Err(err) if RelayError::from(io::Error::from(err.kind())) == RelayError::Wait => {}
        Err(err) => return Err(err),
    }

    Ok(mio::net::TcpStream::from_std(socket.into()))
}

#[cfg(target_os = "linux")]
fn libc_einprogress() -> i32 {
    115
}

#[cfg(not(target_os = "linux"))]
fn libc_einprogress() -> i32 {
    36
}
