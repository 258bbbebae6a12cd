//! Listener binding.
//!
//! Binds the proxy's TCP listener through `socket2` so SO_REUSEADDR is always
//! set and SO_REUSEPORT can be requested, letting several proxy processes
//! share one port.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::TcpListener;

const BACKLOG: i32 = 1024;

/// Bind a non-blocking TCP listener on `addr`.
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    if reuse_port {
        set_reuse_port(&socket)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
fn set_reuse_port(socket: &Socket) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    let optval: libc::c_int = 1;
    // SAFETY: the fd is owned by `socket` for the duration of the call and
    // optval outlives it.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of_val(&optval) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
fn set_reuse_port(_socket: &Socket) -> std::io::Result<()> {
    tracing::warn!("SO_REUSEPORT is not supported on this platform, ignoring");
    Ok(())
}
