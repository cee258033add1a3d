//! The reactor: readiness demultiplexing, dispatch, timers, and wake-up.
//!
//! One reactor per thread. The reactor owns every socket bound to it (in
//! slab slots addressed by [`ConnId`]/[`ListenerId`]), the shared swap page
//! used as the overflow tail of scatter reads, the timer queue, and a
//! loopback UDP control socket that other threads can poke through a
//! [`Waker`] to make [`Reactor::run`] return.
//!
//! # Callback slots
//!
//! Every logical operation is armed by installing exactly one callback in
//! its slot; the reactor fires it at most once per arming. Before invoking a
//! handler the dispatcher moves it out of the slot, so a handler that
//! re-arms its own slot is never clobbered by slot clearing. Re-arming from
//! inside the handler is the only way to keep an operation going.
//!
//! # Destruction during callbacks
//!
//! Handles are generation-counted: destroying a socket inside its own
//! callback frees the slot and bumps the generation, and every dispatch path
//! revalidates the handle before touching the socket again. A stale handle
//! can never reach a successor that reuses the slot.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Instant;

use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Interest, Poll};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::Buffer;
use crate::builder::ReactorBuilder;
use crate::connection::{Connection, SocketState};
use crate::endpoint::Endpoint;
use crate::listener::Listener;
use crate::pollable::{
    conn_token, listener_token, ConnId, ListenerId, LISTENER_TOKEN_OFFSET, WAKER_TOKEN,
};
use crate::state::{NetError, NetState};

/// Fired once per armed read with the bytes drained into the read buffer.
/// Zero bytes with `Ok` means the peer closed its write side.
pub type ReadCallback = Box<dyn FnOnce(&mut Reactor, ConnId, usize, NetState) + 'static>;

/// Fired once per logical write with the total bytes flushed, after the
/// write buffer fully drains or the first error.
pub type WriteCallback = Box<dyn FnOnce(&mut Reactor, ConnId, usize, NetState) + 'static>;

/// Fired once when a non-blocking connect resolves.
pub type ConnectCallback = Box<dyn FnOnce(&mut Reactor, ConnId, NetState) + 'static>;

/// Fired once per armed accept with the freshly installed connection, or
/// `None` and an error.
pub type AcceptCallback =
    Box<dyn FnOnce(&mut Reactor, ListenerId, Option<ConnId>, NetState) + 'static>;

/// Two-phase handler for an asynchronous close.
///
/// While the socket drains in the closing state, `on_data` is called for
/// every chunk the peer is still sending. `on_close` is terminal: it fires
/// exactly once, with `Ok` at EOF or the error that ended the drain, after
/// which the socket is gone unless the handler already destroyed it.
pub trait CloseHandler {
    fn on_data(&mut self, reactor: &mut Reactor, conn: ConnId, bytes: usize);
    fn on_close(self: Box<Self>, reactor: &mut Reactor, conn: ConnId, state: NetState);
}

/// Size of the wake-up datagram.
const WAKE_DATAGRAM_LEN: usize = 8;

/// Cross-thread wake-up handle.
///
/// The only thread-safe object in the crate. `wake()` sends one fixed-size
/// datagram to the reactor's control socket; the reactor drains it on the
/// next dispatch cycle and returns from [`Reactor::run`].
#[derive(Debug)]
pub struct Waker {
    socket: std::net::UdpSocket,
    target: SocketAddr,
}

impl Waker {
    /// Interrupt the reactor's run loop.
    pub fn wake(&self) -> io::Result<()> {
        self.socket
            .send_to(&[0u8; WAKE_DATAGRAM_LEN], self.target)
            .map(|_| ())
    }
}

/// An accept completion parked for delivery at the top of the next loop
/// iteration, so arming with cached readiness never re-enters user code.
struct PendingAccept {
    listener: ListenerId,
    callback: AcceptCallback,
    conn: Option<ConnId>,
    state: NetState,
}

/// A readiness event lifted out of the OS batch before dispatch.
///
/// Targets are resolved to generation-checked handles at collection time, so
/// a callback that frees (and a later arming that reuses) a slot cannot
/// misdirect the rest of the batch.
struct RawEvent {
    target: EventTarget,
    readable: bool,
    writable: bool,
    read_closed: bool,
    error: bool,
}

#[derive(Clone, Copy)]
enum EventTarget {
    Waker,
    Conn(ConnId),
    Listener(ListenerId),
}

/// Single-threaded edge-triggered reactor.
pub struct Reactor {
    poll: Poll,
    events: Events,
    conns: Slab<Connection>,
    /// Per-slot generation counters; bumped when a slot is vacated.
    generations: Vec<u32>,
    listeners: Slab<Listener>,
    timers: crate::timer::TimerQueue,
    /// Shared scratch page: the second iovec segment of every scatter read.
    swap_buffer: Box<[u8]>,
    /// Control socket registered with the poller (wake-up delivery).
    ctrl: UdpSocket,
    /// The same socket, kept in std form for cloning into wakers.
    ctrl_std: std::net::UdpSocket,
    /// Bound address of the control socket, discovered via getsockname.
    ctrl_addr: SocketAddr,
    /// Latched when the control socket is drained; checked after dispatch.
    woken: bool,
    pending_accepts: VecDeque<PendingAccept>,
    backlog: u32,
    read_buffer_size: usize,
    write_buffer_size: usize,
}

/// Read the pending `SO_ERROR` of a socket.
fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: fd is a live socket; err/len are valid out-pointers.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    debug_assert_eq!(ret, 0, "SO_ERROR retrieval failed on a live socket");
    err
}

impl Reactor {
    /// Create a reactor with default settings.
    pub fn new() -> Result<Self, NetError> {
        ReactorBuilder::new().build()
    }

    /// Create a builder for configuring the reactor.
    pub fn builder() -> ReactorBuilder {
        ReactorBuilder::new()
    }

    pub(crate) fn with_builder(b: ReactorBuilder) -> Result<Self, NetError> {
        let poll = Poll::new()?;

        // The control socket is UDP bound to an ephemeral loopback port
        // because it is the simplest self-addressable datagram sink.
        let ctrl_std = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        ctrl_std.set_nonblocking(true)?;
        let ctrl_addr = ctrl_std.local_addr()?;
        let mut ctrl = UdpSocket::from_std(ctrl_std.try_clone()?);
        poll.registry()
            .register(&mut ctrl, WAKER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(b.events_capacity),
            conns: Slab::new(),
            generations: Vec::new(),
            listeners: Slab::new(),
            timers: crate::timer::TimerQueue::new(),
            swap_buffer: vec![0u8; b.swap_buffer_size].into_boxed_slice(),
            ctrl,
            ctrl_std,
            ctrl_addr,
            woken: false,
            pending_accepts: VecDeque::new(),
            backlog: b.backlog,
            read_buffer_size: b.read_buffer_size,
            write_buffer_size: b.write_buffer_size,
        })
    }

    // === Handles ===

    fn conn_id_at(&self, slot: usize) -> ConnId {
        ConnId::new(slot, self.generations[slot])
    }

    /// Resolve a handle to its live slot, or `None` if the socket is gone.
    fn conn_slot(&self, id: ConnId) -> Option<usize> {
        let slot = id.slot();
        if self.conns.contains(slot) && self.generations.get(slot).copied() == Some(id.generation())
        {
            Some(slot)
        } else {
            None
        }
    }

    fn insert_conn(&mut self, conn: Connection) -> ConnId {
        let slot = self.conns.insert(conn);
        if self.generations.len() <= slot {
            self.generations.resize(slot + 1, 0);
        }
        self.conn_id_at(slot)
    }

    fn remove_conn(&mut self, slot: usize) {
        let mut conn = self.conns.remove(slot);
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        if conn.readiness.registered() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        // Dropping the stream closes the descriptor.
    }

    // === Registration ===

    fn watch_conn_read(&mut self, slot: usize) {
        let conn = &mut self.conns[slot];
        if conn.readiness.watch_read {
            return;
        }
        let token = conn_token(slot);
        let res = if conn.readiness.watch_write {
            self.poll
                .registry()
                .reregister(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE)
        } else {
            self.poll
                .registry()
                .register(&mut conn.stream, token, Interest::READABLE)
        };
        res.expect("readiness registration failed");
        conn.readiness.watch_read = true;
    }

    fn watch_conn_write(&mut self, slot: usize) {
        let conn = &mut self.conns[slot];
        if conn.readiness.watch_write {
            return;
        }
        let token = conn_token(slot);
        let res = if conn.readiness.watch_read {
            self.poll
                .registry()
                .reregister(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE)
        } else {
            self.poll
                .registry()
                .register(&mut conn.stream, token, Interest::WRITABLE)
        };
        res.expect("readiness registration failed");
        conn.readiness.watch_write = true;
    }

    #[allow(dead_code)]
    pub(crate) fn unwatch_conn_read(&mut self, slot: usize) {
        let conn = &mut self.conns[slot];
        if !conn.readiness.watch_read {
            return;
        }
        let res = if conn.readiness.watch_write {
            self.poll
                .registry()
                .reregister(&mut conn.stream, conn_token(slot), Interest::WRITABLE)
        } else {
            self.poll.registry().deregister(&mut conn.stream)
        };
        res.expect("readiness registration failed");
        conn.readiness.watch_read = false;
    }

    #[allow(dead_code)]
    pub(crate) fn unwatch_conn_write(&mut self, slot: usize) {
        let conn = &mut self.conns[slot];
        if !conn.readiness.watch_write {
            return;
        }
        let res = if conn.readiness.watch_read {
            self.poll
                .registry()
                .reregister(&mut conn.stream, conn_token(slot), Interest::READABLE)
        } else {
            self.poll.registry().deregister(&mut conn.stream)
        };
        res.expect("readiness registration failed");
        conn.readiness.watch_write = false;
    }

    fn watch_listener_read(&mut self, slot: usize) {
        let listener = &mut self.listeners[slot];
        if listener.readiness.watch_read {
            return;
        }
        self.poll
            .registry()
            .register(&mut listener.listener, listener_token(slot), Interest::READABLE)
            .expect("readiness registration failed");
        listener.readiness.watch_read = true;
    }

    // === Socket creation ===

    /// Bind a listening socket.
    pub fn bind(&mut self, endpoint: &Endpoint) -> Result<ListenerId, NetError> {
        let listener = Listener::bind(endpoint, self.backlog)?;
        let slot = self.listeners.insert(listener);
        tracing::debug!(endpoint = %endpoint, listener = slot, "listening");
        Ok(ListenerId(slot))
    }

    /// Start a non-blocking connect; `callback` fires when it resolves.
    pub fn connect(
        &mut self,
        endpoint: &Endpoint,
        callback: ConnectCallback,
    ) -> Result<ConnId, NetError> {
        // socket2 opens the descriptor with SOCK_CLOEXEC on Linux.
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        socket.set_reuse_address(true)?;
        match socket.connect(&SocketAddr::from(*endpoint).into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e.into()),
        }

        let stream = TcpStream::from_std(socket.into());
        let mut conn = Connection::new(
            stream,
            SocketState::Connecting,
            self.read_buffer_size,
            self.write_buffer_size,
        );
        conn.connect_cb = Some(callback);
        let id = self.insert_conn(conn);
        // Write readiness signals connect completion.
        self.watch_conn_write(id.slot());
        tracing::debug!(endpoint = %endpoint, conn = ?id, "connecting");
        Ok(id)
    }

    fn install_accepted(&mut self, fd: RawFd) -> ConnId {
        // Safety: fd was just returned by accept4 and ownership moves here.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        let conn = Connection::new(
            TcpStream::from_std(std_stream),
            SocketState::Connected,
            self.read_buffer_size,
            self.write_buffer_size,
        );
        self.insert_conn(conn)
    }

    // === Arming ===

    /// Arm the one-shot accept slot of a listener.
    ///
    /// If readiness is already cached the accept runs now and its completion
    /// is parked until the top of the next loop iteration, so this call
    /// never re-enters user code.
    ///
    /// # Panics
    ///
    /// Panics on a stale listener id or if the slot is already armed.
    pub fn accept(&mut self, id: ListenerId, callback: AcceptCallback) {
        assert!(self.listeners.contains(id.0), "stale listener id");
        assert!(
            self.listeners[id.0].accept_cb.is_none(),
            "accept callback already armed"
        );
        self.watch_listener_read(id.0);

        if !self.listeners[id.0].readiness.can_read {
            self.listeners[id.0].accept_cb = Some(callback);
            return;
        }
        match self.listeners[id.0].do_accept() {
            // The cache was stale; wait for the next notification.
            Ok(None) => self.listeners[id.0].accept_cb = Some(callback),
            Ok(Some(fd)) => {
                let conn = self.install_accepted(fd);
                self.pending_accepts.push_back(PendingAccept {
                    listener: id,
                    callback,
                    conn: Some(conn),
                    state: Ok(()),
                });
            }
            Err(e) => {
                self.pending_accepts.push_back(PendingAccept {
                    listener: id,
                    callback,
                    conn: None,
                    state: Err(e),
                });
            }
        }
    }

    /// Arm the one-shot read slot of a connection.
    ///
    /// If readiness is already cached the read runs now; the callback fires
    /// synchronously when it produced bytes, EOF, or an error, and otherwise
    /// stays armed for the next notification.
    ///
    /// # Panics
    ///
    /// Panics on a stale id, a socket that is not connected, or if the slot
    /// is already armed.
    pub fn recv(&mut self, id: ConnId, callback: ReadCallback) {
        let slot = self.conn_slot(id).expect("stale connection id");
        {
            let conn = &mut self.conns[slot];
            assert!(
                conn.state == SocketState::Connected,
                "recv on a socket that is not connected"
            );
            assert!(conn.read_cb.is_none(), "read callback already armed");
            conn.read_cb = Some(callback);
        }
        self.watch_conn_read(slot);

        if self.conns[slot].readiness.can_read || self.conns[slot].eof {
            let (n, state) = self.conns[slot].do_read(&mut self.swap_buffer);
            if n > 0 || self.conns[slot].eof || state.is_err() {
                let cb = self.conns[slot].read_cb.take().expect("read callback armed");
                cb(self, id, n, state);
            }
        }
    }

    /// Append `data` to the write buffer and arm the one-shot write slot.
    ///
    /// The callback fires once the buffer fully drains, reporting the total
    /// bytes of this logical write, or on the first error with the bytes
    /// flushed before it.
    ///
    /// # Panics
    ///
    /// Panics on a stale id, a socket that is not connected, or if the slot
    /// is already armed.
    pub fn send(&mut self, id: ConnId, data: &[u8], callback: WriteCallback) {
        let slot = self.conn_slot(id).expect("stale connection id");
        let appended = {
            let conn = &mut self.conns[slot];
            assert!(
                conn.state == SocketState::Connected,
                "send on a socket that is not connected"
            );
            assert!(conn.write_cb.is_none(), "write callback already armed");
            conn.write_buf.write(data)
        };
        if !appended {
            // Fixed-size write buffer cannot take the payload.
            callback(self, id, 0, Err(NetError::system(libc::ENOBUFS)));
            return;
        }
        self.conns[slot].write_cb = Some(callback);
        self.watch_conn_write(slot);

        if self.conns[slot].readiness.can_write {
            self.flush_write(slot, id);
        }
    }

    /// Begin an asynchronous close: half-close the write side and drain
    /// reads through `handler` until EOF or an error.
    ///
    /// Finish outstanding writes first: unflushed write-buffer contents are
    /// discarded.
    ///
    /// # Panics
    ///
    /// Panics on a stale id, a socket that is not connected, a write still
    /// armed, or if a close is already in progress.
    pub fn shutdown(&mut self, id: ConnId, handler: Box<dyn CloseHandler>) {
        let slot = self.conn_slot(id).expect("stale connection id");
        {
            let conn = &mut self.conns[slot];
            assert!(
                conn.state == SocketState::Connected,
                "shutdown on a socket that is not connected"
            );
            assert!(conn.close_cb.is_none(), "close already in progress");
            assert!(conn.write_cb.is_none(), "shutdown with a write still armed");
            conn.state = SocketState::Closing;
            conn.close_cb = Some(handler);
            conn.write_buf.clear();
            conn.prev_write_size = 0;
            // FIN to the peer; reads keep draining below.
            let _ = conn.stream.shutdown(std::net::Shutdown::Write);
        }
        self.watch_conn_read(slot);

        if self.conns[slot].readiness.can_read || self.conns[slot].eof {
            self.drain_closing(slot, id);
        }
    }

    /// Destroy a connection immediately: unregister, close the descriptor,
    /// invalidate the handle. Safe to call with a stale id.
    pub fn close(&mut self, id: ConnId) {
        if let Some(slot) = self.conn_slot(id) {
            tracing::debug!(conn = ?id, "closing connection");
            self.remove_conn(slot);
        }
    }

    /// Destroy a listener. Safe to call with a stale id.
    pub fn close_listener(&mut self, id: ListenerId) {
        if self.listeners.contains(id.0) {
            let mut listener = self.listeners.remove(id.0);
            if listener.readiness.registered() {
                let _ = self.poll.registry().deregister(&mut listener.listener);
            }
            tracing::debug!(listener = id.0, "closed listener");
        }
    }

    /// Schedule a one-shot timer `delay_ms` from now.
    pub fn schedule(&mut self, delay_ms: u64, callback: impl FnOnce(&mut Reactor, u64) + 'static) {
        self.timers.schedule(delay_ms, Box::new(callback));
    }

    /// A cross-thread handle that makes [`run`](Self::run) return.
    pub fn waker(&self) -> Result<Waker, NetError> {
        Ok(Waker {
            socket: self.ctrl_std.try_clone()?,
            target: self.ctrl_addr,
        })
    }

    // === Introspection ===

    /// Access a connection's read buffer.
    ///
    /// # Panics
    ///
    /// Panics on a stale id.
    pub fn with_read_buffer<R>(&mut self, id: ConnId, f: impl FnOnce(&mut Buffer) -> R) -> R {
        let slot = self.conn_slot(id).expect("stale connection id");
        f(&mut self.conns[slot].read_buf)
    }

    /// Bytes buffered and readable on a connection.
    pub fn read_buffer_len(&self, id: ConnId) -> usize {
        let slot = self.conn_slot(id).expect("stale connection id");
        self.conns[slot].read_buf.readable_size()
    }

    /// The locally bound endpoint of a connection.
    pub fn local_endpoint(&self, id: ConnId) -> Result<Endpoint, NetError> {
        let slot = self.conn_slot(id).expect("stale connection id");
        match self.conns[slot].stream.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr.into()),
            SocketAddr::V6(_) => Err(NetError::system(libc::EAFNOSUPPORT)),
        }
    }

    /// The peer endpoint of a connection.
    pub fn peer_endpoint(&self, id: ConnId) -> Result<Endpoint, NetError> {
        let slot = self.conn_slot(id).expect("stale connection id");
        match self.conns[slot].stream.peer_addr()? {
            SocketAddr::V4(addr) => Ok(addr.into()),
            SocketAddr::V6(_) => Err(NetError::system(libc::EAFNOSUPPORT)),
        }
    }

    /// The bound endpoint of a listener (useful after binding port zero).
    pub fn listener_endpoint(&self, id: ListenerId) -> Result<Endpoint, NetError> {
        assert!(self.listeners.contains(id.0), "stale listener id");
        match self.listeners[id.0].listener.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr.into()),
            SocketAddr::V6(_) => Err(NetError::system(libc::EAFNOSUPPORT)),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Capacity of the shared swap page.
    pub fn swap_buffer_capacity(&self) -> usize {
        self.swap_buffer.len()
    }

    // === Main loop ===

    /// Run the event loop until a [`Waker`] fires.
    ///
    /// Returns `Ok(())` on wake-up, or the error that broke the readiness
    /// wait.
    pub fn run(&mut self) -> Result<(), NetError> {
        self.woken = false;
        let mut baseline = Instant::now();
        loop {
            // Deliver accept completions parked by arming with cached
            // readiness before blocking again.
            self.execute_pending_accepts();

            let timeout = self.timers.next_timeout();
            loop {
                match self.poll.poll(&mut self.events, timeout) {
                    Ok(()) => break,
                    // Restart the wait without refreshing the timer baseline.
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            let batch = self.collect_events();
            let batch_empty = batch.is_empty();
            self.dispatch(batch);

            // Timer maintenance runs after dispatch, against the pre-wait
            // baseline.
            let now = Instant::now();
            self.timers
                .advance(now.duration_since(baseline).as_millis() as i64);
            baseline = now;

            if batch_empty {
                // The wait timed out: fire the coincidence band around the
                // heap head.
                for (scheduled, callback) in self.timers.pop_coincident() {
                    callback(self, scheduled);
                }
            }

            if self.woken {
                tracing::trace!("run loop interrupted");
                return Ok(());
            }
        }
    }

    fn execute_pending_accepts(&mut self) {
        while let Some(pending) = self.pending_accepts.pop_front() {
            (pending.callback)(self, pending.listener, pending.conn, pending.state);
        }
    }

    /// Lift the OS event batch into generation-checked targets.
    fn collect_events(&mut self) -> Vec<RawEvent> {
        let mut batch = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            let target = if token == WAKER_TOKEN {
                EventTarget::Waker
            } else if token.0 >= LISTENER_TOKEN_OFFSET {
                EventTarget::Listener(ListenerId(token.0 - LISTENER_TOKEN_OFFSET))
            } else if self.conns.contains(token.0) {
                EventTarget::Conn(self.conn_id_at(token.0))
            } else {
                continue;
            };
            batch.push(RawEvent {
                target,
                readable: event.is_readable(),
                writable: event.is_writable(),
                read_closed: event.is_read_closed(),
                error: event.is_error(),
            });
        }
        batch
    }

    fn dispatch(&mut self, batch: Vec<RawEvent>) {
        for event in batch {
            match event.target {
                EventTarget::Waker => self.drain_ctrl(),
                EventTarget::Listener(id) => self.dispatch_listener(id, &event),
                EventTarget::Conn(id) => self.dispatch_conn(id, &event),
            }
        }
    }

    fn drain_ctrl(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.ctrl.recv_from(&mut buf) {
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        self.woken = true;
        tracing::trace!("control socket drained, wake-up latched");
    }

    fn dispatch_listener(&mut self, id: ListenerId, event: &RawEvent) {
        if !self.listeners.contains(id.0) {
            return;
        }
        if event.error {
            let code = socket_error(self.listeners[id.0].listener.as_raw_fd());
            if code != 0 {
                self.listener_on_exception(id, NetError::system(code));
                return;
            }
        }
        if event.readable || event.read_closed {
            self.listener_on_read_notify(id);
        }
    }

    fn dispatch_conn(&mut self, id: ConnId, event: &RawEvent) {
        debug_assert!(
            event.readable || event.writable || event.read_closed || event.error,
            "event with no recognised readiness bits"
        );
        if event.error {
            let slot = match self.conn_slot(id) {
                Some(slot) => slot,
                None => return,
            };
            let code = socket_error(self.conns[slot].stream.as_raw_fd());
            if code != 0 {
                self.conn_on_exception(id, NetError::system(code));
                return;
            }
        }
        // A hang-up translates to a read notification and, like the error
        // branch, ends this event's processing. The hang-up is latched so
        // the read path knows the EOF will produce no further edges.
        if event.read_closed {
            if let Some(slot) = self.conn_slot(id) {
                self.conns[slot].hup = true;
            }
            self.conn_on_read_notify(id);
            return;
        }
        if event.readable {
            self.conn_on_read_notify(id);
        }
        // The read callback may have destroyed the socket; prove it is
        // still live before the write half runs.
        if event.writable && self.conn_slot(id).is_some() {
            self.conn_on_write_notify(id);
        }
    }

    // === Connection notifications ===

    fn conn_on_read_notify(&mut self, id: ConnId) {
        let slot = match self.conn_slot(id) {
            Some(slot) => slot,
            None => return,
        };
        match self.conns[slot].state {
            // Read readiness is meaningless before the connect resolves.
            SocketState::Connecting | SocketState::Disconnected | SocketState::Closed => {}
            SocketState::Connected => {
                self.conns[slot].readiness.can_read = true;
                // No callback armed: leave the bytes in the kernel so TCP
                // flow control pushes back on the peer.
                if self.conns[slot].read_cb.is_none() {
                    return;
                }
                let (n, state) = self.conns[slot].do_read(&mut self.swap_buffer);
                let cb = self.conns[slot].read_cb.take().expect("read callback armed");
                cb(self, id, n, state);
            }
            SocketState::Closing => {
                self.conns[slot].readiness.can_read = true;
                self.drain_closing(slot, id);
            }
        }
    }

    fn conn_on_write_notify(&mut self, id: ConnId) {
        let slot = match self.conn_slot(id) {
            Some(slot) => slot,
            None => return,
        };
        match self.conns[slot].state {
            SocketState::Connecting => {
                // Write readiness is how the kernel announces the connect
                // resolved successfully.
                let conn = &mut self.conns[slot];
                conn.state = SocketState::Connected;
                conn.readiness.can_write = true;
                let cb = conn.connect_cb.take();
                tracing::debug!(conn = ?id, "connected");
                if let Some(cb) = cb {
                    cb(self, id, Ok(()));
                }
            }
            SocketState::Disconnected | SocketState::Closed => {}
            SocketState::Connected | SocketState::Closing => {
                self.conns[slot].readiness.can_write = true;
                if self.conns[slot].write_buf.is_empty() {
                    // Nothing queued; readiness stays cached for the next
                    // send.
                    return;
                }
                self.flush_write(slot, id);
            }
        }
    }

    /// One write pass plus the completion accounting for the logical write.
    fn flush_write(&mut self, slot: usize, id: ConnId) {
        if self.conns[slot].write_buf.is_empty() {
            return;
        }
        match self.conns[slot].do_write() {
            Ok(n) => {
                let conn = &mut self.conns[slot];
                if conn.write_buf.is_empty() {
                    let total = conn.prev_write_size + n;
                    conn.prev_write_size = 0;
                    if let Some(cb) = conn.write_cb.take() {
                        cb(self, id, total, Ok(()));
                    }
                } else {
                    // Partial flush: accumulate and wait for the next
                    // notification.
                    conn.prev_write_size += n;
                }
            }
            Err(err) => {
                let conn = &mut self.conns[slot];
                let total = conn.prev_write_size;
                conn.prev_write_size = 0;
                if let Some(cb) = conn.write_cb.take() {
                    cb(self, id, total, Err(err));
                }
            }
        }
    }

    /// The closing-state read path: keep handing drained bytes to the close
    /// handler until EOF or an error terminates it.
    fn drain_closing(&mut self, slot: usize, id: ConnId) {
        loop {
            if self.conns[slot].close_cb.is_none() {
                return;
            }
            let (n, state) = self.conns[slot].do_read(&mut self.swap_buffer);
            match state {
                Err(err) => {
                    let handler = self.conns[slot].close_cb.take().expect("close handler armed");
                    handler.on_close(self, id, Err(err));
                    self.finish_close(id);
                    return;
                }
                Ok(()) => {
                    if n > 0 {
                        let mut handler =
                            self.conns[slot].close_cb.take().expect("close handler armed");
                        handler.on_data(self, id, n);
                        match self.conn_slot(id) {
                            Some(live) => {
                                debug_assert_eq!(live, slot);
                                if self.conns[live].close_cb.is_none() {
                                    self.conns[live].close_cb = Some(handler);
                                }
                                if !self.conns[live].eof {
                                    return;
                                }
                                // Fall through and replay the EOF.
                            }
                            None => return,
                        }
                    } else if self.conns[slot].eof {
                        let handler =
                            self.conns[slot].close_cb.take().expect("close handler armed");
                        handler.on_close(self, id, Ok(()));
                        self.finish_close(id);
                        return;
                    } else {
                        // Spurious notification; wait for the next one.
                        return;
                    }
                }
            }
        }
    }

    /// Close the descriptor after a terminal close callback, unless the
    /// handler already destroyed the socket.
    fn finish_close(&mut self, id: ConnId) {
        if let Some(slot) = self.conn_slot(id) {
            self.conns[slot].state = SocketState::Closed;
            self.remove_conn(slot);
        }
    }

    fn conn_on_exception(&mut self, id: ConnId, err: NetError) {
        let slot = match self.conn_slot(id) {
            Some(slot) => slot,
            None => return,
        };
        tracing::debug!(conn = ?id, errno = err.code, "socket exception");
        match self.conns[slot].state {
            SocketState::Connecting => {
                self.conns[slot].state = SocketState::Disconnected;
                if let Some(cb) = self.conns[slot].connect_cb.take() {
                    cb(self, id, Err(err));
                }
                // A failed connect leaves nothing worth keeping.
                if let Some(slot) = self.conn_slot(id) {
                    self.remove_conn(slot);
                }
            }
            SocketState::Closing => {
                if let Some(handler) = self.conns[slot].close_cb.take() {
                    handler.on_close(self, id, Err(err));
                    self.finish_close(id);
                }
            }
            SocketState::Disconnected | SocketState::Closed => {}
            SocketState::Connected => {
                if let Some(cb) = self.conns[slot].read_cb.take() {
                    cb(self, id, 0, Err(err));
                }
                // The read callback may have destroyed the socket.
                if let Some(slot) = self.conn_slot(id) {
                    if let Some(cb) = self.conns[slot].write_cb.take() {
                        cb(self, id, 0, Err(err));
                    }
                }
            }
        }
    }

    // === Listener notifications ===

    fn listener_on_read_notify(&mut self, id: ListenerId) {
        self.listeners[id.0].readiness.can_read = true;
        if self.listeners[id.0].accept_cb.is_none() {
            return;
        }
        match self.listeners[id.0].do_accept() {
            // Backlog drained; the armed callback waits for the next
            // notification.
            Ok(None) => {}
            Ok(Some(fd)) => {
                let conn = self.install_accepted(fd);
                tracing::debug!(listener = id.0, conn = ?conn, "accepted connection");
                let cb = self.listeners[id.0].accept_cb.take().expect("accept callback armed");
                cb(self, id, Some(conn), Ok(()));
            }
            Err(err) => {
                let cb = self.listeners[id.0].accept_cb.take().expect("accept callback armed");
                cb(self, id, None, Err(err));
            }
        }
    }

    fn listener_on_exception(&mut self, id: ListenerId, err: NetError) {
        self.listeners[id.0].recover_fd_exhaustion(err.code);
        if let Some(cb) = self.listeners[id.0].accept_cb.take() {
            cb(self, id, None, Err(err));
        }
    }
}
