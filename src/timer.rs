//! Min-heap of one-shot relative-time callbacks.
//!
//! Entries are keyed on relative milliseconds. Instead of decrementing every
//! entry after each dispatch batch, the queue folds elapsed time into a
//! single offset; an entry's effective remaining time is its stored key
//! minus the offset. Subtracting a constant preserves heap order, so this is
//! the same maintenance rule at O(1) per batch.
//!
//! Near-coincident entries fire together: when the wait times out, every
//! entry within the coincidence band of the heap head is popped and invoked
//! exactly once. The band absorbs wake-up jitter from the readiness wait.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use crate::reactor::Reactor;

/// One-shot timer callback, fired with the entry's scheduled delay.
pub type TimerCallback = Box<dyn FnOnce(&mut Reactor, u64) + 'static>;

/// Entries within this many milliseconds of the heap head fire together.
const COINCIDENCE_BAND_MS: i64 = 3;

struct TimerEntry {
    /// Relative deadline with the queue offset folded in.
    rel: i64,
    /// Insertion order, for a stable heap among equal deadlines.
    seq: u64,
    /// The delay the caller asked for, handed back to the callback.
    scheduled: u64,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rel == other.rel && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rel.cmp(&other.rel).then(self.seq.cmp(&other.seq))
    }
}

/// The reactor's timer queue.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    /// Elapsed time folded into stored deadlines.
    offset: i64,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            offset: 0,
            seq: 0,
        }
    }

    /// Add a one-shot entry firing `delay_ms` from now.
    pub fn schedule(&mut self, delay_ms: u64, callback: TimerCallback) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            rel: delay_ms as i64 + self.offset,
            seq,
            scheduled: delay_ms,
            callback,
        }));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remaining time of the head entry, as the readiness-wait timeout.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse(e)| Duration::from_millis((e.rel - self.offset).max(0) as u64))
    }

    /// Fold `elapsed_ms` of wall-clock time into every entry.
    pub fn advance(&mut self, elapsed_ms: i64) {
        if !self.heap.is_empty() {
            self.offset += elapsed_ms;
        }
    }

    /// Pop every entry within the coincidence band of the head.
    ///
    /// Returns the scheduled delays and callbacks in heap order; each entry
    /// is delivered exactly once.
    pub fn pop_coincident(&mut self) -> Vec<(u64, TimerCallback)> {
        let mut fired = Vec::new();
        let head_rel = match self.heap.peek() {
            Some(Reverse(e)) => e.rel,
            None => return fired,
        };
        while let Some(Reverse(e)) = self.heap.peek() {
            if (e.rel - head_rel).abs() >= COINCIDENCE_BAND_MS {
                break;
            }
            let Reverse(e) = self.heap.pop().unwrap();
            fired.push((e.scheduled, e.callback));
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_, _| {})
    }

    #[test]
    fn next_timeout_tracks_head() {
        let mut q = TimerQueue::new();
        assert!(q.next_timeout().is_none());

        q.schedule(100, noop());
        q.schedule(20, noop());
        assert_eq!(q.next_timeout(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn advance_reduces_remaining_time() {
        let mut q = TimerQueue::new();
        q.schedule(100, noop());
        q.advance(30);
        assert_eq!(q.next_timeout(), Some(Duration::from_millis(70)));
    }

    #[test]
    fn advance_clamps_overdue_to_zero() {
        let mut q = TimerQueue::new();
        q.schedule(10, noop());
        q.advance(50);
        assert_eq!(q.next_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn coincident_entries_fire_together() {
        let mut q = TimerQueue::new();
        q.schedule(50, noop());
        q.schedule(51, noop());
        q.schedule(100, noop());
        q.advance(50);

        let fired = q.pop_coincident();
        assert_eq!(
            fired.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            vec![50, 51]
        );
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_timeout(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn band_is_measured_from_the_head() {
        let mut q = TimerQueue::new();
        q.schedule(50, noop());
        q.schedule(52, noop());
        q.schedule(54, noop());
        q.advance(50);

        // 54 is within 3ms of 52 but not of the head at 50.
        let fired = q.pop_coincident();
        assert_eq!(fired.len(), 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn entries_scheduled_after_advance_are_unaffected() {
        let mut q = TimerQueue::new();
        q.schedule(100, noop());
        q.advance(60);
        q.schedule(100, noop());
        // First entry has 40ms left, the new one the full 100ms.
        assert_eq!(q.next_timeout(), Some(Duration::from_millis(40)));
        q.advance(40);
        let fired = q.pop_coincident();
        assert_eq!(fired.len(), 1);
        assert_eq!(q.next_timeout(), Some(Duration::from_millis(60)));
    }

    #[test]
    fn pop_on_empty_queue_is_empty() {
        let mut q = TimerQueue::new();
        assert!(q.pop_coincident().is_empty());
    }
}
