//! TCP Fast Open connect-with-data, and the plain non-blocking connect path used when
//! Fast Open is disabled, unsupported, or the Session is a direct/ACL-bypass connection.
//!
//! Only Linux exposes `TCP_FASTOPEN_CONNECT`; on every other target this module silently
//! falls back to a plain connect, which is also how the teacher's own platform-gated
//! socket setup code (the `cfg(any(target_os = ...))` blocks at the bottom of its
//! `Cargo.toml`) is organized.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;

/// Outcome of a connect attempt that may have also sent the first data segment.
pub struct Connected {
    pub stream: TcpStream,
    /// Bytes of `initial_data` actually written as part of the connect call. Zero
    /// unless Fast Open sent data atomically with the SYN.
    pub sent: usize,
}

/// Builds the non-blocking outbound socket with the options the spec calls for
/// (`TCP_NODELAY`, `SO_NOSIGPIPE` where supported, optional bind-to-interface), but does
/// not connect it yet.
fn new_outbound_socket(addr: SocketAddr, interface: Option<&str>) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))] {
            socket.set_nosigpipe(true)?;
        }
    }

    if let Some(iface) = interface {
        bind_to_interface(&socket, iface)?;
    }

    Ok(socket)
}

#[cfg(target_os = "linux")]
fn bind_to_interface(socket: &Socket, iface: &str) -> io::Result<()> {
    socket.bind_device(Some(iface.as_bytes()))
}

#[cfg(not(target_os = "linux"))]
fn bind_to_interface(_socket: &Socket, _iface: &str) -> io::Result<()> {
    // Binding to a named interface is a Linux-only (`SO_BINDTODEVICE`) facility.
    Ok(())
}

/// Plain connect: arm connectivity, then hand the stream back once writable. The
/// connect timeout (per §4.5) is the caller's responsibility via `tokio::time::timeout`.
pub async fn connect_plain(addr: SocketAddr, interface: Option<&str>) -> io::Result<TcpStream> {
    let socket = new_outbound_socket(addr, interface)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }

    let stream = TcpStream::from_std(socket.into())?;
    stream.writable().await?;
    // A successful peer-name lookup is proof the handshake completed.
    stream.peer_addr()?;
    Ok(stream)
}

#[cfg(target_os = "linux")]
const TCP_FASTOPEN_CONNECT: libc::c_int = 30;

/// Attempts to connect with the first data segment sent atomically in the SYN
/// (`TCP_FASTOPEN_CONNECT`). `ENOTCONN` means the kernel doesn't support it; the caller
/// should disable Fast Open process-wide and retry with [`connect_plain`].
#[cfg(target_os = "linux")]
pub async fn connect_fastopen(addr: SocketAddr, interface: Option<&str>, initial_data: &[u8]) -> io::Result<Connected> {
    use std::os::unix::io::AsRawFd;

    let socket = new_outbound_socket(addr, interface)?;

    let enable: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            TCP_FASTOPEN_CONNECT,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }

    let stream = TcpStream::from_std(socket.into())?;
    stream.writable().await?;

    match stream.try_write(initial_data) {
        Ok(n) => Ok(Connected { stream, sent: n }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Connected { stream, sent: 0 }),
        Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Err(e),
        Err(e) => Err(e),
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn connect_fastopen(addr: SocketAddr, interface: Option<&str>, initial_data: &[u8]) -> io::Result<Connected> {
    // Fast Open is a Linux-only path here; elsewhere we transparently fall back.
    let stream = connect_plain(addr, interface).await?;
    let sent = match stream.try_write(initial_data) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
        Err(e) => return Err(e),
    };
    Ok(Connected { stream, sent })
}

/// True iff `err` is the platform's signal that Fast Open connect is unsupported and
/// the feature should be disabled process-wide (§4.3/§7).
pub fn is_fastopen_unsupported(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOTCONN)
}
