//! Listening socket: bind, accept, and FD-exhaustion recovery.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};

use crate::endpoint::Endpoint;
use crate::pollable::Readiness;
use crate::reactor::AcceptCallback;
use crate::state::NetError;

pub(crate) struct Listener {
    pub listener: TcpListener,
    pub readiness: Readiness,
    pub accept_cb: Option<AcceptCallback>,
    /// FD reserved on `/dev/null` so one slot can be freed to drain an
    /// accept when the process runs out of descriptors.
    dummy_fd: Option<File>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("listener", &self.listener)
            .field("readiness", &self.readiness)
            .field("accept_cb", &self.accept_cb.is_some())
            .field("dummy_fd", &self.dummy_fd)
            .finish()
    }
}

impl Listener {
    /// Create a non-blocking, `SO_REUSEADDR`, close-on-exec listening socket
    /// bound to `endpoint`.
    pub fn bind(endpoint: &Endpoint, backlog: u32) -> Result<Self, NetError> {
        // socket2 opens the descriptor with SOCK_CLOEXEC on Linux.
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&std::net::SocketAddr::from(*endpoint).into())?;
        socket.listen(backlog as i32)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(Self {
            listener: TcpListener::from_std(std_listener),
            readiness: Readiness::new(),
            accept_cb: None,
            dummy_fd: Some(Self::open_reservation()?),
        })
    }

    fn open_reservation() -> io::Result<File> {
        File::open("/dev/null")
    }

    /// Accept one pending connection, retrying through `EINTR`.
    ///
    /// `Ok(None)` means the backlog is drained (`can_read` cleared). On
    /// `EMFILE`/`ENFILE` the reserved descriptor is sacrificed to accept and
    /// immediately close one pending connection, so the rejected peer gets a
    /// graceful FIN instead of hanging in the backlog.
    pub fn do_accept(&mut self) -> Result<Option<RawFd>, NetError> {
        debug_assert!(self.readiness.can_read);
        let fd = self.listener.as_raw_fd();
        loop {
            // Safety: fd is a live listening socket owned by self.
            let nfd = unsafe {
                libc::accept4(
                    fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                )
            };
            if nfd >= 0 {
                return Ok(Some(nfd));
            }

            let code = io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            if code == libc::EAGAIN || code == libc::EWOULDBLOCK {
                self.readiness.can_read = false;
                return Ok(None);
            }
            if code == libc::EINTR {
                continue;
            }
            self.recover_fd_exhaustion(code);
            return Err(NetError::system(code));
        }
    }

    /// Free one descriptor slot so the kernel can hand over a pending
    /// connection, close it, then re-arm the reservation.
    ///
    /// Without this the kernel keeps the connection in the backlog and
    /// re-notifies forever while the process has no slot to accept into.
    pub fn recover_fd_exhaustion(&mut self, code: i32) {
        if code != libc::EMFILE && code != libc::ENFILE {
            return;
        }
        tracing::warn!(errno = code, "accept failed: out of file descriptors");

        drop(self.dummy_fd.take());
        let fd = self.listener.as_raw_fd();
        // Safety: fd is a live listening socket; the accepted descriptor is
        // closed immediately below.
        let rejected = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if rejected >= 0 {
            // Safety: rejected was just returned by accept.
            unsafe { libc::close(rejected) };
        } else {
            let errno = io::Error::last_os_error().raw_os_error();
            if errno == Some(libc::EAGAIN) || errno == Some(libc::EWOULDBLOCK) {
                self.readiness.can_read = false;
            }
        }
        self.dummy_fd =
            Some(Self::open_reservation().expect("cannot re-open /dev/null reservation"));
        debug_assert!(self.has_fd_reservation());
    }

    /// Returns true if the `/dev/null` reservation is currently held.
    pub fn has_fd_reservation(&self) -> bool {
        self.dummy_fd.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;

    #[test]
    fn bind_on_ephemeral_port() {
        let listener = Listener::bind(&Endpoint::loopback(0), 128).unwrap();
        let addr = listener.listener.local_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
        assert!(listener.has_fd_reservation());
    }

    #[test]
    fn bind_conflict_reports_system_error() {
        let first = Listener::bind(&Endpoint::loopback(0), 128).unwrap();
        let port = first.listener.local_addr().unwrap().port();
        // SO_REUSEADDR does not allow two live listeners on one port.
        let err = Listener::bind(&Endpoint::loopback(port), 128).unwrap_err();
        assert_eq!(err.code, libc::EADDRINUSE);
    }

    #[test]
    fn accept_returns_descriptor_then_drains() {
        let mut listener = Listener::bind(&Endpoint::loopback(0), 128).unwrap();
        let addr = listener.listener.local_addr().unwrap();
        let _peer = StdTcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        listener.readiness.can_read = true;
        let fd = listener.do_accept().unwrap().expect("one pending connection");
        // Safety: fd was just accepted and is owned by this test.
        unsafe { libc::close(fd) };

        assert_eq!(listener.do_accept().unwrap(), None);
        assert!(!listener.readiness.can_read);
    }
}
