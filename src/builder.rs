//! Reactor builder with fluent API.

use crate::reactor::Reactor;
use crate::state::NetError;

/// Default swap page size, sized so one scatter read drains a full kernel
/// receive queue on common configurations.
pub(crate) const DEFAULT_SWAP_BUFFER_SIZE: usize = 3_495_200;

/// Default readiness-wait event batch.
pub(crate) const DEFAULT_EVENTS_CAPACITY: usize = 256;

/// Default initial capacity for per-connection read/write buffers.
pub(crate) const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Builder for creating a [`Reactor`] with custom configuration.
///
/// # Example
///
/// ```no_run
/// use net_reactor::Reactor;
///
/// let reactor = Reactor::builder()
///     .swap_buffer_size(1 << 20)
///     .read_buffer_size(16 * 1024)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ReactorBuilder {
    pub(crate) swap_buffer_size: usize,
    pub(crate) events_capacity: usize,
    pub(crate) backlog: u32,
    pub(crate) read_buffer_size: usize,
    pub(crate) write_buffer_size: usize,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            swap_buffer_size: DEFAULT_SWAP_BUFFER_SIZE,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            backlog: libc::SOMAXCONN as u32,
            read_buffer_size: DEFAULT_BUFFER_CAPACITY,
            write_buffer_size: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Set the size of the shared swap page used as the overflow tail of
    /// every scatter read. Zero selects the default.
    pub fn swap_buffer_size(mut self, size: usize) -> Self {
        self.swap_buffer_size = if size == 0 {
            DEFAULT_SWAP_BUFFER_SIZE
        } else {
            size
        };
        self
    }

    /// Set the readiness-wait event batch capacity.
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity.max(1);
        self
    }

    /// Set the listen backlog for sockets bound through this reactor.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the initial capacity of per-connection read buffers.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the initial capacity of per-connection write buffers.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Build the reactor.
    pub fn build(self) -> Result<Reactor, NetError> {
        Reactor::with_builder(self)
    }
}
