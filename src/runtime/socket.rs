//! Listening socket setup.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use tracing::warn;

/// Latency-related socket options.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    /// Set `TCP_NODELAY`.
    pub nodelay: bool,
    /// Set `TCP_QUICKACK` (Linux only, ignored elsewhere).
    pub quickack: bool,
}

/// Create a TCP listener bound to `addr` with `SO_REUSEADDR` set.
///
/// Only socket creation, bind and listen failures are reported; the
/// remaining options are best effort.
pub fn listen_on(
    addr: SocketAddr,
    backlog: u32,
    nonblocking: bool,
    options: SocketOptions,
) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!(error = %e, "Failed to set SO_REUSEADDR");
    }
    if options.nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if options.quickack {
            if let Err(e) = socket.set_quickack(true) {
                warn!(error = %e, "Failed to set TCP_QUICKACK");
            }
        }
    }

    if nonblocking {
        socket.set_nonblocking(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::SockRef;

    const OPTIONS: SocketOptions = SocketOptions {
        nodelay: true,
        quickack: true,
    };

    #[test]
    fn test_listen_on_ephemeral_port() {
        let listener = listen_on("127.0.0.1:0".parse().unwrap(), 64, true, OPTIONS).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let sock = SockRef::from(&listener);
        assert!(sock.reuse_address().unwrap());
        assert!(sock.nodelay().unwrap());

        // Nonblocking listener with nothing pending.
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_blocking_listener_accepts() {
        let listener = listen_on("127.0.0.1:0".parse().unwrap(), 8, false, OPTIONS).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (_, peer) = listener.accept().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[test]
    fn test_port_in_use_fails() {
        let first = listen_on("127.0.0.1:0".parse().unwrap(), 64, true, OPTIONS).unwrap();
        let addr = first.local_addr().unwrap();

        let err = listen_on(addr, 64, true, OPTIONS).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
