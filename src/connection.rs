//! Connected-socket state and the read/write engine.
//!
//! A [`Connection`] owns the stream, its read/write buffers, and the one-shot
//! callback slots. The reactor drives it through `do_read`/`do_write`, which
//! perform the actual syscalls and maintain the edge-triggered readiness
//! cache: a direction's `can_*` flag is cleared exactly when a syscall in
//! that direction returns `EAGAIN`/`EWOULDBLOCK` or, for reads, zero.

use std::io;
use std::os::unix::io::AsRawFd;

use mio::net::TcpStream;

use crate::buffer::Buffer;
use crate::pollable::Readiness;
use crate::reactor::{CloseHandler, ConnectCallback, ReadCallback, WriteCallback};
use crate::state::{NetError, NetState};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketState {
    /// A client socket whose connect failed. Terminal.
    Disconnected,
    /// A client socket waiting for the non-blocking connect to resolve.
    Connecting,
    Connected,
    /// Asynchronous close in progress: write side shut, draining reads.
    Closing,
    Closed,
}

pub(crate) struct Connection {
    pub stream: TcpStream,
    pub readiness: Readiness,
    pub state: SocketState,
    /// The peer sent FIN. Monotonic: once set, reads return zero until the
    /// socket closes.
    pub eof: bool,
    /// A hang-up was observed on a readiness event. The EOF behind the
    /// final bytes produces no further edges, so `do_read` polls through
    /// short reads until it consumes the zero.
    pub hup: bool,
    pub read_buf: Buffer,
    pub write_buf: Buffer,
    /// Bytes already flushed for the current logical write, across previous
    /// notifications.
    pub prev_write_size: usize,
    pub read_cb: Option<ReadCallback>,
    pub write_cb: Option<WriteCallback>,
    pub connect_cb: Option<ConnectCallback>,
    pub close_cb: Option<Box<dyn CloseHandler>>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        state: SocketState,
        read_capacity: usize,
        write_capacity: usize,
    ) -> Self {
        Self {
            stream,
            readiness: Readiness::new(),
            state,
            eof: false,
            hup: false,
            read_buf: Buffer::with_capacity(read_capacity),
            write_buf: Buffer::with_capacity(write_capacity),
            prev_write_size: 0,
            read_cb: None,
            write_cb: None,
            connect_cb: None,
            close_cb: None,
        }
    }

    /// Drain the kernel with scatter reads until `EAGAIN`, EOF, or an error.
    ///
    /// Each `readv` targets two segments: the read buffer's writable tail and
    /// the reactor's shared swap page. A single call usually empties the
    /// kernel queue, so most reads cost one syscall regardless of how far the
    /// buffer would have had to grow. Surplus that landed in the swap page is
    /// injected into the buffer with exact growth.
    ///
    /// Returns the bytes accumulated this call and the resulting state.
    pub fn do_read(&mut self, swap: &mut [u8]) -> (usize, NetState) {
        // Replay EOF to every read until the socket is closed.
        if self.eof {
            return (0, Ok(()));
        }
        let fd = self.stream.as_raw_fd();
        let mut total = 0usize;
        loop {
            let mut acc = self.read_buf.write_accessor();
            let tail = acc.as_mut_slice();
            let tail_len = tail.len();
            let iov = [
                libc::iovec {
                    iov_base: tail.as_mut_ptr().cast(),
                    iov_len: tail_len,
                },
                libc::iovec {
                    iov_base: swap.as_mut_ptr().cast(),
                    iov_len: swap.len(),
                },
            ];
            // Safety: both segments point into live, exclusively borrowed
            // slices for the duration of the call.
            let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };

            if n < 0 {
                let code = io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO);
                if code == libc::EAGAIN || code == libc::EWOULDBLOCK {
                    self.readiness.can_read = false;
                    return (total, Ok(()));
                }
                if code == libc::EINTR {
                    continue;
                }
                return (total, Err(NetError::system(code)));
            }
            if n == 0 {
                self.eof = true;
                self.readiness.can_read = false;
                return (total, Ok(()));
            }

            let n = n as usize;
            if n <= tail_len {
                acc.commit(n);
            } else {
                acc.commit(tail_len);
                if !self.read_buf.inject(&swap[..n - tail_len]) {
                    // Fixed read buffer cannot take the surplus.
                    return (total, Err(NetError::system(libc::ENOBUFS)));
                }
            }
            total += n;

            if n < tail_len + swap.len() {
                // A latched hang-up means an EOF is pending right behind
                // this data and will never produce another edge; poll it
                // now instead of returning on the short read.
                if self.hup {
                    continue;
                }
                // The kernel gave us less than we asked for; it is drained.
                self.readiness.can_read = false;
                return (total, Ok(()));
            }
        }
    }

    /// Write the full readable span of the write buffer once.
    ///
    /// Returns the bytes accepted by the kernel (zero when the socket is not
    /// ready). A short write clears `can_write`; the remainder stays buffered
    /// for the next notification. The caller accounts the result into
    /// `prev_write_size`.
    pub fn do_write(&mut self) -> Result<usize, NetError> {
        debug_assert!(self.write_buf.readable_size() > 0);
        let fd = self.stream.as_raw_fd();
        loop {
            let acc = self.write_buf.read_accessor();
            let span = acc.as_slice();
            let span_len = span.len();
            // Safety: span is a live borrow for the duration of the call.
            let n = unsafe { libc::write(fd, span.as_ptr().cast(), span_len) };

            // write(2) can return zero on sockets for historic reasons;
            // treat it like -1 and consult errno.
            if n <= 0 {
                let code = io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO);
                if code == libc::EAGAIN || code == libc::EWOULDBLOCK {
                    self.readiness.can_write = false;
                    return Ok(0);
                }
                if code == libc::EINTR {
                    continue;
                }
                return Err(NetError::system(code));
            }

            let n = n as usize;
            if n < span_len {
                self.readiness.can_write = false;
            }
            acc.commit(n);
            return Ok(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    /// A connected non-blocking pair: (connection under test, peer).
    fn connected_pair(read_capacity: usize) -> (Connection, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let conn = Connection::new(
            TcpStream::from_std(accepted),
            SocketState::Connected,
            read_capacity,
            4096,
        );
        (conn, peer)
    }

    #[test]
    fn read_fitting_the_tail() {
        let (mut conn, mut peer) = connected_pair(4096);
        peer.write_all(b"ping").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut swap = vec![0u8; 4096];
        let (n, state) = conn.do_read(&mut swap);
        assert!(state.is_ok());
        assert_eq!(n, 4);
        assert_eq!(conn.read_buf.as_slice(), b"ping");
        // The short read drained the kernel; readiness cache is cleared.
        assert!(!conn.readiness.can_read);
        assert!(!conn.eof);
    }

    #[test]
    fn read_overflows_into_swap() {
        let (mut conn, mut peer) = connected_pair(4);
        let payload: Vec<u8> = (0..64u8).collect();
        peer.write_all(&payload).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut swap = vec![0u8; 4096];
        let (n, state) = conn.do_read(&mut swap);
        assert!(state.is_ok());
        assert_eq!(n, 64);
        assert_eq!(conn.read_buf.as_slice(), &payload[..]);
    }

    #[test]
    fn read_on_idle_socket_clears_readiness() {
        let (mut conn, _peer) = connected_pair(4096);
        conn.readiness.can_read = true;

        let mut swap = vec![0u8; 4096];
        let (n, state) = conn.do_read(&mut swap);
        assert!(state.is_ok());
        assert_eq!(n, 0);
        assert!(!conn.readiness.can_read);
    }

    #[test]
    fn eof_is_monotonic() {
        let (mut conn, peer) = connected_pair(4096);
        drop(peer);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut swap = vec![0u8; 4096];
        let (n, state) = conn.do_read(&mut swap);
        assert!(state.is_ok());
        assert_eq!(n, 0);
        assert!(conn.eof);

        // Replayed without touching the kernel.
        let (n, state) = conn.do_read(&mut swap);
        assert!(state.is_ok());
        assert_eq!(n, 0);
        assert!(conn.eof);
    }

    #[test]
    fn data_then_eof() {
        let (mut conn, mut peer) = connected_pair(4096);
        peer.write_all(b"last words").unwrap();
        drop(peer);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut swap = vec![0u8; 4096];
        let (n, state) = conn.do_read(&mut swap);
        assert!(state.is_ok());
        assert_eq!(n, 10);
        assert_eq!(conn.read_buf.as_slice(), b"last words");

        // The FIN surfaces on the next read as a clean zero.
        let (n, state) = conn.do_read(&mut swap);
        assert!(state.is_ok());
        assert_eq!(n, 0);
        assert!(conn.eof);
    }

    #[test]
    fn hang_up_consumes_eof_in_one_pass() {
        let (mut conn, mut peer) = connected_pair(4096);
        peer.write_all(b"last words").unwrap();
        drop(peer);
        std::thread::sleep(std::time::Duration::from_millis(20));

        // With the hang-up latched, the short read polls on through to the
        // zero instead of stopping.
        conn.hup = true;
        let mut swap = vec![0u8; 4096];
        let (n, state) = conn.do_read(&mut swap);
        assert!(state.is_ok());
        assert_eq!(n, 10);
        assert_eq!(conn.read_buf.as_slice(), b"last words");
        assert!(conn.eof);
        assert!(!conn.readiness.can_read);
    }

    #[test]
    fn write_drains_the_buffer() {
        let (mut conn, _peer) = connected_pair(4096);
        assert!(conn.write_buf.write(b"response"));

        let n = conn.do_write().unwrap();
        assert_eq!(n, 8);
        assert!(conn.write_buf.is_empty());
    }

    #[test]
    fn write_error_carries_errno() {
        let (mut conn, peer) = connected_pair(4096);
        drop(peer);
        std::thread::sleep(std::time::Duration::from_millis(20));

        // Early writes may be accepted into the socket buffer; keep writing
        // until the reset lands.
        assert!(conn.write_buf.write(b"x"));
        let mut last = conn.do_write();
        for _ in 0..50 {
            if last.is_err() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(conn.write_buf.write(b"y"));
            last = conn.do_write();
        }
        let err = last.unwrap_err();
        assert!(err.code == libc::EPIPE || err.code == libc::ECONNRESET);
    }
}
