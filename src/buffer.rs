//! Growable byte buffer with separate read and write cursors.
//!
//! The backing allocation is a single contiguous region. Data between
//! `read_pos` and `write_pos` is readable; the remainder up to the capacity
//! is writable. When the readable span empties, both cursors rewind to zero
//! so the full capacity becomes writable again without copying.
//!
//! Scoped [`WriteAccessor`] / [`ReadAccessor`] views expose the raw spans for
//! scatter-gather syscalls; committing an accessor advances the matching
//! cursor. Any other mutation invalidates an accessor's view, which the
//! borrow checker enforces.

/// A contiguous buffer with read/write cursors.
///
/// Invariant: `read_pos <= write_pos <= capacity` after every mutation.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    /// Data before this has been consumed.
    read_pos: usize,
    /// Data has been written up to here.
    write_pos: usize,
    /// When set, the buffer never reallocates.
    fixed: bool,
}

impl Buffer {
    /// Create a growable buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            fixed: false,
        }
    }

    /// Create a fixed-size buffer that refuses to grow.
    pub fn fixed(capacity: usize) -> Self {
        Self {
            fixed: true,
            ..Self::with_capacity(capacity)
        }
    }

    /// Total capacity of the backing allocation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns true if growth is disabled.
    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_size(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes of writable tail capacity.
    #[inline]
    pub fn writable_size(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Returns true if there is no data to read.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// The readable span.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Reallocate so the writable tail holds exactly `writable_needed` bytes.
    ///
    /// Only the readable span is copied, landing at offset zero.
    fn grow(&mut self, writable_needed: usize) {
        let readable = self.readable_size();
        let mut next = vec![0u8; readable + writable_needed].into_boxed_slice();
        next[..readable].copy_from_slice(&self.data[self.read_pos..self.write_pos]);
        self.data = next;
        self.read_pos = 0;
        self.write_pos = readable;
    }

    /// Rewind both cursors once the readable span empties.
    #[inline]
    fn rewind(&mut self) {
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Append `src`, growing (doubled capacity, at least `src.len()`) when the
    /// tail is too small. Never partial.
    ///
    /// Returns false only when the buffer is fixed and the tail cannot hold
    /// `src`.
    pub fn write(&mut self, src: &[u8]) -> bool {
        if self.writable_size() < src.len() {
            if self.fixed {
                return false;
            }
            let next = src.len().max(self.capacity()) * 2;
            self.grow(next);
        }
        self.data[self.write_pos..self.write_pos + src.len()].copy_from_slice(src);
        self.write_pos += src.len();
        true
    }

    /// Append as much of `src` as fits in the tail without growing.
    ///
    /// Returns the number of bytes copied.
    pub fn fill(&mut self, src: &[u8]) -> usize {
        let n = self.writable_size().min(src.len());
        if n > 0 {
            self.data[self.write_pos..self.write_pos + n].copy_from_slice(&src[..n]);
            self.write_pos += n;
        }
        n
    }

    /// Append exactly `src`, growing by exactly the shortfall.
    ///
    /// Unlike [`write`](Self::write) there is no doubling: this is the drain
    /// path for the surplus of a scatter read, where the caller already knows
    /// the final size and must not over-allocate. Post-condition:
    /// `write_pos == capacity`.
    ///
    /// Returns false when the buffer is fixed and the tail cannot hold `src`.
    pub fn inject(&mut self, src: &[u8]) -> bool {
        if self.writable_size() < src.len() {
            if self.fixed {
                return false;
            }
            self.grow(src.len());
            debug_assert_eq!(self.writable_size(), src.len());
        }
        self.data[self.write_pos..self.write_pos + src.len()].copy_from_slice(src);
        self.write_pos += src.len();
        true
    }

    /// Discard all readable data, resetting both cursors.
    #[inline]
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Consume up to `size` bytes, returning the consumed span.
    ///
    /// The read cursor advances by `min(size, readable_size())`; the returned
    /// slice has exactly that length. If the readable span empties, the
    /// buffer rewinds.
    pub fn read(&mut self, size: usize) -> &[u8] {
        let n = size.min(self.readable_size());
        let start = self.read_pos;
        self.read_pos += n;
        self.rewind();
        &self.data[start..start + n]
    }

    /// Scoped view of the writable tail; committing advances the write cursor.
    pub fn write_accessor(&mut self) -> WriteAccessor<'_> {
        WriteAccessor { buf: self }
    }

    /// Scoped view of the readable span; committing advances the read cursor.
    pub fn read_accessor(&mut self) -> ReadAccessor<'_> {
        ReadAccessor { buf: self }
    }
}

/// Scoped view of a buffer's writable tail.
///
/// Obtained from [`Buffer::write_accessor`]. `commit(n)` records that `n`
/// bytes of the tail were filled and advances the write cursor.
#[derive(Debug)]
pub struct WriteAccessor<'a> {
    buf: &'a mut Buffer,
}

impl WriteAccessor<'_> {
    /// Length of the writable tail.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.writable_size()
    }

    /// Returns true if the tail is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The writable tail.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.buf.write_pos;
        &mut self.buf.data[start..]
    }

    /// Commit `n` filled bytes, advancing the write cursor.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the tail length.
    pub fn commit(self, n: usize) {
        assert!(
            n <= self.buf.writable_size(),
            "commit({}) exceeds writable tail ({})",
            n,
            self.buf.writable_size()
        );
        self.buf.write_pos += n;
    }
}

/// Scoped view of a buffer's readable span.
///
/// Obtained from [`Buffer::read_accessor`]. `commit(n)` records that `n`
/// bytes were consumed and advances the read cursor.
#[derive(Debug)]
pub struct ReadAccessor<'a> {
    buf: &'a mut Buffer,
}

impl ReadAccessor<'_> {
    /// Length of the readable span.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.readable_size()
    }

    /// Returns true if there is nothing to read.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The readable span.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Commit `n` consumed bytes, advancing the read cursor.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the readable span.
    pub fn commit(self, n: usize) {
        assert!(
            n <= self.buf.readable_size(),
            "commit({}) exceeds readable span ({})",
            n,
            self.buf.readable_size()
        );
        self.buf.read_pos += n;
        self.buf.rewind();
    }
}
