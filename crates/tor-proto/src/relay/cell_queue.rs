//! Per-circuit, per-direction outbound cell queue.
//!
//! Every relay circuit has two of these: one queue of packed cells waiting
//! to go out the `p` side, one waiting to go out the `n` side. The
//! [`super::mux::CircuitMux`] drains them one cell at a time as the
//! underlying channel has room.

use std::collections::VecDeque;

use coarsetime::Instant;
use tor_cell::chancell::AnyChanCell;

/// A packed cell together with the (coarse) instant it was enqueued.
///
/// The timestamp is used only for OOM victim selection (the cell-queue
/// handler closes the circuit whose oldest queued cell is oldest first) and
/// for latency statistics; it plays no role in forwarding order.
struct Entry {
    /// The packed cell, ready to hand to the channel writer.
    cell: AnyChanCell,
    /// When this cell was pushed onto the queue.
    inserted_at: Instant,
}

/// Outcome of a [`CellQueue::push_packed`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PushOutcome {
    /// The cell was queued normally.
    Queued,
    /// The cell was queued, and the queue has just crossed its high
    /// watermark: the caller should block packaging of further edge data
    /// on this circuit's direction until a matching `Drained` comes back.
    CrossedHighWatermark,
    /// The cell was *not* queued: the queue was already at its configured
    /// maximum length. Per spec this is a fatal, circuit-closing condition
    /// (`RESOURCELIMIT`).
    Overflow,
}

/// Outcome of a [`CellQueue::pop`] call relevant to flow-control gating.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PopOutcome {
    /// The queue is still above the low watermark (or was already empty).
    Unchanged,
    /// Popping this cell brought the queue's length down to (or below) the
    /// low watermark: the caller should unblock packaging of edge data.
    CrossedLowWatermark,
}

/// Configuration for a [`CellQueue`]'s watermarks and hard maximum.
///
/// The default values match the spec's stated defaults (max length ≈2500
/// cells / ≈1 MiB at the standard 512-byte cell size).
#[derive(Copy, Clone, Debug)]
pub(crate) struct CellQueueParams {
    /// Queue length (in cells) at or above which the circuit is considered
    /// "blocked on channel": packaging of new edge data for this direction
    /// stops.
    pub(crate) high_watermark: usize,
    /// Queue length (in cells) at or below which a previously blocked
    /// circuit is unblocked again.
    pub(crate) low_watermark: usize,
    /// Hard maximum queue length. Exceeding it is a fatal, circuit-closing
    /// condition.
    pub(crate) max_len: usize,
}

impl Default for CellQueueParams {
    fn default() -> Self {
        Self {
            high_watermark: 1000,
            low_watermark: 900,
            max_len: 2500,
        }
    }
}

/// A FIFO of packed cells awaiting transmission in one direction on one
/// circuit.
///
/// Invariant: `self.len()` always equals the number of cells reachable by
/// draining the queue via repeated [`CellQueue::pop`] calls.
pub(crate) struct CellQueue {
    /// The cells themselves, in send order.
    cells: VecDeque<Entry>,
    /// Watermarks and hard maximum for this queue.
    params: CellQueueParams,
    /// Whether we are currently above the high watermark (and so have
    /// told the caller to stop packaging).
    blocked: bool,
}

impl CellQueue {
    /// Create a new, empty cell queue with the given watermark
    /// configuration.
    pub(crate) fn new(params: CellQueueParams) -> Self {
        Self {
            cells: VecDeque::new(),
            params,
            blocked: false,
        }
    }

    /// Number of cells currently queued.
    pub(crate) fn len(&self) -> usize {
        self.cells.len()
    }

    /// True if the queue holds no cells.
    pub(crate) fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The insertion time of the oldest queued cell, if any.
    ///
    /// Used by the memory governor's OOM handler to rank circuits by the
    /// age of their oldest queued cell.
    pub(crate) fn oldest_insertion(&self) -> Option<Instant> {
        self.cells.front().map(|e| e.inserted_at)
    }

    /// Push a packed cell onto the back of the queue.
    pub(crate) fn push_packed(&mut self, cell: AnyChanCell, now: Instant) -> PushOutcome {
        if self.cells.len() >= self.params.max_len {
            return PushOutcome::Overflow;
        }
        self.cells.push_back(Entry {
            cell,
            inserted_at: now,
        });
        if !self.blocked && self.cells.len() >= self.params.high_watermark {
            self.blocked = true;
            return PushOutcome::CrossedHighWatermark;
        }
        PushOutcome::Queued
    }

    /// Pop the next cell to send, if any, along with whether this pop
    /// crossed the low watermark.
    pub(crate) fn pop(&mut self) -> (Option<AnyChanCell>, PopOutcome) {
        let cell = self.cells.pop_front().map(|e| e.cell);
        if self.blocked && self.cells.len() <= self.params.low_watermark {
            self.blocked = false;
            return (cell, PopOutcome::CrossedLowWatermark);
        }
        (cell, PopOutcome::Unchanged)
    }

    /// Discard every queued cell.
    ///
    /// Used when a circuit is torn down: the queue's contents are no
    /// longer meaningful once the circuit is marked for close, beyond the
    /// brief drain window described in §4.3/§7.
    pub(crate) fn clear(&mut self) {
        self.cells.clear();
        self.blocked = false;
    }

    /// Whether the queue is currently above its high watermark.
    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tor_cell::chancell::{msg::AnyChanMsg, CircId};

    fn dummy_cell() -> AnyChanCell {
        AnyChanCell::new(CircId::new(1), AnyChanMsg::Padding(Default::default()))
    }

    #[test]
    fn len_matches_reachable_count() {
        let mut q = CellQueue::new(CellQueueParams::default());
        let now = Instant::now();
        for _ in 0..5 {
            q.push_packed(dummy_cell(), now);
        }
        assert_eq!(q.len(), 5);
        let mut drained = 0;
        while q.pop().0.is_some() {
            drained += 1;
        }
        assert_eq!(drained, 5);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn high_and_low_watermarks_toggle_blocked() {
        let params = CellQueueParams {
            high_watermark: 3,
            low_watermark: 1,
            max_len: 10,
        };
        let mut q = CellQueue::new(params);
        let now = Instant::now();
        assert_eq!(q.push_packed(dummy_cell(), now), PushOutcome::Queued);
        assert_eq!(q.push_packed(dummy_cell(), now), PushOutcome::Queued);
        assert_eq!(
            q.push_packed(dummy_cell(), now),
            PushOutcome::CrossedHighWatermark
        );
        assert!(q.is_blocked());

        let (_, outcome) = q.pop();
        assert_eq!(outcome, PopOutcome::Unchanged);
        let (_, outcome) = q.pop();
        assert_eq!(outcome, PopOutcome::CrossedLowWatermark);
        assert!(!q.is_blocked());
    }

    #[test]
    fn overflow_past_max_len_is_fatal() {
        let params = CellQueueParams {
            high_watermark: 100,
            low_watermark: 90,
            max_len: 2,
        };
        let mut q = CellQueue::new(params);
        let now = Instant::now();
        assert_eq!(q.push_packed(dummy_cell(), now), PushOutcome::Queued);
        assert_eq!(q.push_packed(dummy_cell(), now), PushOutcome::Queued);
        assert_eq!(q.push_packed(dummy_cell(), now), PushOutcome::Overflow);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn oldest_insertion_tracks_head() {
        let mut q = CellQueue::new(CellQueueParams::default());
        let t0 = Instant::now();
        q.push_packed(dummy_cell(), t0);
        assert_eq!(q.oldest_insertion(), Some(t0));
        q.pop();
        assert_eq!(q.oldest_insertion(), None);
    }
}
