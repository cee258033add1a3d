//! net-reactor - single-threaded edge-triggered TCP reactor for Linux.
//!
//! This crate provides non-blocking TCP client and server endpoints driven
//! by one-shot completion callbacks, a dual-cursor I/O buffer tuned for
//! scatter-gather reads, a readiness-based event loop, a min-heap timer
//! queue, and a cross-thread wake-up handle.
//!
//! # Model
//!
//! - **One reactor per thread.** Sockets, buffers, and callbacks bound to a
//!   reactor must only be touched from its thread; the only thread-safe
//!   object is the [`Waker`].
//! - **Edge-triggered readiness.** Readiness is cached per direction and
//!   cleared exactly when a syscall returns `EAGAIN` (or, for reads, zero);
//!   every notification is drained to that point.
//! - **One-shot callbacks.** Each operation is armed by installing exactly
//!   one callback per slot, fired at most once per arming. Re-arm from
//!   inside the handler to keep an operation going.
//!
//! # Quick Start
//!
//! An echo server:
//!
//! ```no_run
//! use net_reactor::{Endpoint, Reactor};
//!
//! fn arm_accept(reactor: &mut Reactor, listener: net_reactor::ListenerId) {
//!     reactor.accept(
//!         listener,
//!         Box::new(move |reactor, listener, conn, state| {
//!             let conn = match (conn, state) {
//!                 (Some(conn), Ok(())) => conn,
//!                 _ => return,
//!             };
//!             arm_echo(reactor, conn);
//!             arm_accept(reactor, listener);
//!         }),
//!     );
//! }
//!
//! fn arm_echo(reactor: &mut Reactor, conn: net_reactor::ConnId) {
//!     reactor.recv(
//!         conn,
//!         Box::new(move |reactor, conn, n, state| {
//!             if state.is_err() || n == 0 {
//!                 reactor.close(conn);
//!                 return;
//!             }
//!             let data = reactor.with_read_buffer(conn, |buf| buf.read(n).to_vec());
//!             reactor.send(conn, &data, Box::new(|_, _, _, _| {}));
//!             arm_echo(reactor, conn);
//!         }),
//!     );
//! }
//!
//! fn main() -> Result<(), net_reactor::NetError> {
//!     let mut reactor = Reactor::new()?;
//!     let listener = reactor.bind(&Endpoint::loopback(7878))?;
//!     arm_accept(&mut reactor, listener);
//!     reactor.run()
//! }
//! ```
//!
//! # Platform
//!
//! Linux-class systems only: the implementation leans on edge-triggered
//! epoll (via mio), `accept4`, scatter-gather `readv`, and `SO_ERROR`.

mod buffer;
mod builder;
mod connection;
mod endpoint;
mod listener;
mod pollable;
mod reactor;
mod state;
mod timer;

// === Re-exports: reactor ===

/// The event loop and socket owner.
pub use reactor::Reactor;
/// Fluent reactor configuration.
pub use builder::ReactorBuilder;
/// Cross-thread wake-up handle.
pub use reactor::Waker;

// === Re-exports: handles and callbacks ===

/// Generation-counted connection handle.
pub use pollable::ConnId;
/// Listening-socket handle.
pub use pollable::ListenerId;

pub use reactor::{AcceptCallback, CloseHandler, ConnectCallback, ReadCallback, WriteCallback};

// === Re-exports: values ===

/// Dual-cursor I/O buffer.
pub use buffer::{Buffer, ReadAccessor, WriteAccessor};
/// IPv4 address + port value object.
pub use endpoint::{Endpoint, ParseEndpointError};
/// Tagged error result.
pub use state::{Category, NetError, NetState};
