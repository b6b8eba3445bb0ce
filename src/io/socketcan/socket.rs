// src/io/socketcan/socket.rs
//
// Raw CAN socket capability.
//
// The registry and listener only ever talk to `SocketProvider` and
// `CanSocket`, so the kernel transport can be swapped for an in-memory one.
// Each socket goes through the same three steps: create, resolve the
// interface name to its kernel index, bind.
//
// This module is only fully functional on Linux.

use std::io;
use std::time::Duration;
use tracing::debug;

use super::codec::RawFrame;
use crate::error::BridgeError;

/// One raw CAN socket. Owns its file descriptor until `close`.
pub trait CanSocket: Send + Sync {
    /// Resolve an interface name to its kernel device index.
    fn resolve_index(&self, name: &str) -> io::Result<u32>;

    /// Bind to a device index.
    fn bind(&self, ifindex: u32) -> io::Result<()>;

    /// Transmit one encoded frame.
    fn send(&self, frame: &RawFrame) -> io::Result<()>;

    /// Receive into `buf`, returning the byte count. Timeouts surface as
    /// `WouldBlock` or `TimedOut`.
    fn recv(&self, buf: &mut RawFrame) -> io::Result<usize>;

    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()>;

    /// Release the descriptor, reporting close errors.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Factory for raw CAN sockets.
pub trait SocketProvider: Send + Sync {
    fn create_socket(&self) -> io::Result<Box<dyn CanSocket>>;
}

/// Receive errors that just mean "no frame within the read timeout".
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Create a socket and bind it to `name`, returning it with the resolved
/// device index. A socket that fails any step is closed before returning.
pub fn open_bound(
    provider: &dyn SocketProvider,
    name: &str,
) -> Result<(Box<dyn CanSocket>, u32), BridgeError> {
    let socket = provider
        .create_socket()
        .map_err(|e| BridgeError::transport(name, "create socket", e))?;

    let ifindex = match socket.resolve_index(name) {
        Ok(index) => index,
        Err(e) => {
            close_quietly(name, socket);
            return Err(BridgeError::transport(name, "resolve interface index", e));
        }
    };

    if let Err(e) = socket.bind(ifindex) {
        close_quietly(name, socket);
        return Err(BridgeError::transport(name, "bind", e));
    }

    Ok((socket, ifindex))
}

fn close_quietly(name: &str, socket: Box<dyn CanSocket>) {
    if let Err(e) = socket.close() {
        debug!(interface = %name, error = %e, "error closing socket after failed setup");
    }
}

#[cfg(target_os = "linux")]
mod linux_impl {
    use socket2::{Domain, Protocol, Socket, Type};
    use socketcan::CanAddr;
    use std::io::{self, Read};
    use std::os::fd::IntoRawFd;
    use std::time::Duration;

    use super::{CanSocket, SocketProvider};
    use crate::io::socketcan::codec::{consts, RawFrame};

    // ============================================================================
    // Kernel Socket
    // ============================================================================

    /// `AF_CAN` / `SOCK_RAW` / `CAN_RAW` socket
    pub struct RawCanSocket {
        socket: Socket,
    }

    impl CanSocket for RawCanSocket {
        fn resolve_index(&self, name: &str) -> io::Result<u32> {
            nix::net::if_::if_nametoindex(name).map_err(io::Error::from)
        }

        fn bind(&self, ifindex: u32) -> io::Result<()> {
            let addr = CanAddr::new(ifindex);
            self.socket.bind(&addr.into_sock_addr())
        }

        fn send(&self, frame: &RawFrame) -> io::Result<()> {
            let written = self.socket.send(frame)?;
            if written != consts::CLASSIC_FRAME_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!(
                        "short write: {} of {} bytes",
                        written,
                        consts::CLASSIC_FRAME_SIZE
                    ),
                ));
            }
            Ok(())
        }

        fn recv(&self, buf: &mut RawFrame) -> io::Result<usize> {
            (&self.socket).read(buf)
        }

        fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
            self.socket.set_read_timeout(Some(timeout))
        }

        fn close(self: Box<Self>) -> io::Result<()> {
            let fd = self.socket.into_raw_fd();
            nix::unistd::close(fd).map_err(io::Error::from)
        }
    }

    /// Opens kernel raw CAN sockets.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct RawSocketProvider;

    impl SocketProvider for RawSocketProvider {
        fn create_socket(&self) -> io::Result<Box<dyn CanSocket>> {
            let socket = Socket::new(
                Domain::from(libc::AF_CAN),
                Type::RAW,
                Some(Protocol::from(libc::CAN_RAW)),
            )?;
            Ok(Box::new(RawCanSocket { socket }))
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::{RawCanSocket, RawSocketProvider};

// ============================================================================
// Non-Linux Stub
// ============================================================================

#[cfg(not(target_os = "linux"))]
mod stub {
    use std::io;

    use super::{CanSocket, SocketProvider};

    /// Raw CAN sockets (stub for non-Linux)
    #[derive(Clone, Copy, Debug, Default)]
    pub struct RawSocketProvider;

    impl SocketProvider for RawSocketProvider {
        fn create_socket(&self) -> io::Result<Box<dyn CanSocket>> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "SocketCAN is only available on Linux",
            ))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::RawSocketProvider;
