//! Per-channel scheduler that drains circuits' outbound cell queues fairly.
//!
//! A [`CircuitMux`] tracks which circuits on one channel currently have
//! something to send (a non-empty [`CellQueue`](super::cell_queue::CellQueue)
//! or a pending `DESTROY`) and picks among them round-robin so that one
//! noisy circuit cannot starve the others. `DESTROY` notifications are kept
//! in a separate queue so that circuit teardown is never delayed behind
//! ordinary data traffic.

use std::collections::VecDeque;

use tor_cell::chancell::{AnyChanCell, CircId};

/// One circuit's outstanding `DESTROY` cell, queued ahead of data traffic.
struct PendingDestroy {
    /// Circuit-id the `DESTROY` should be sent under (the onward half's
    /// id, already substituted per §4.3).
    circ_id: CircId,
    /// The packed `DESTROY` cell itself.
    cell: AnyChanCell,
}

/// Scheduler selecting, for one channel, which circuit's queue to drain
/// next.
///
/// This struct owns no cell storage itself (`CellQueue`s live on the
/// circuits); it only owns the fairness bookkeeping: the rotation of
/// "active" circuit ids and the destroy fast-path.
pub(crate) struct CircuitMux {
    /// Circuit ids with a non-empty outbound queue, in round-robin order.
    ///
    /// The circuit at the front is the next one considered for a data
    /// cell. After a circuit yields a cell it is moved to the back,
    /// unless its queue is now empty (in which case it's dropped here and
    /// re-added by [`CircuitMux::mark_active`] the next time it has
    /// something to send).
    active: VecDeque<CircId>,
    /// `DESTROY` cells waiting to be sent, independent of `active`.
    destroys: VecDeque<PendingDestroy>,
}

impl Default for CircuitMux {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitMux {
    /// Create an empty mux for a freshly opened channel.
    pub(crate) fn new() -> Self {
        Self {
            active: VecDeque::new(),
            destroys: VecDeque::new(),
        }
    }

    /// Record that `circ_id`'s outbound queue has become non-empty.
    ///
    /// A no-op if the circuit is already tracked as active.
    pub(crate) fn mark_active(&mut self, circ_id: CircId) {
        if !self.active.contains(&circ_id) {
            self.active.push_back(circ_id);
        }
    }

    /// Stop considering `circ_id` for scheduling (its queue just drained
    /// to empty, or the circuit is being torn down).
    pub(crate) fn mark_inactive(&mut self, circ_id: CircId) {
        self.active.retain(|id| *id != circ_id);
    }

    /// Queue a `DESTROY` cell for prompt, traffic-independent delivery.
    pub(crate) fn queue_destroy(&mut self, circ_id: CircId, cell: AnyChanCell) {
        self.destroys.push_back(PendingDestroy { circ_id, cell });
    }

    /// True if there is nothing left to send: no active circuit and no
    /// pending `DESTROY`.
    pub(crate) fn is_idle(&self) -> bool {
        self.active.is_empty() && self.destroys.is_empty()
    }

    /// Pop the next `DESTROY` cell to send, if any.
    ///
    /// Callers should always drain this ahead of ordinary data cells, so
    /// teardown notifications are never stuck behind a queue of data
    /// traffic (§4.5).
    pub(crate) fn pop_destroy(&mut self) -> Option<(CircId, AnyChanCell)> {
        self.destroys.pop_front().map(|d| (d.circ_id, d.cell))
    }

    /// Pick the next circuit-id that should be asked for a data cell, if
    /// any, rotating it to the back of the fairness queue.
    ///
    /// The caller is responsible for actually popping a cell from that
    /// circuit's [`CellQueue`](super::cell_queue::CellQueue) and, if the
    /// queue is now empty, calling [`CircuitMux::mark_inactive`].
    pub(crate) fn next_active(&mut self) -> Option<CircId> {
        let id = self.active.pop_front()?;
        self.active.push_back(id);
        Some(id)
    }

    /// Number of circuits currently considered active (for statistics).
    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn cid(n: u32) -> CircId {
        CircId::new(n).unwrap()
    }

    #[test]
    fn round_robins_active_circuits() {
        let mut mux = CircuitMux::new();
        mux.mark_active(cid(1));
        mux.mark_active(cid(2));
        mux.mark_active(cid(3));

        let order: Vec<_> = (0..6).map(|_| mux.next_active().unwrap()).collect();
        assert_eq!(
            order,
            vec![cid(1), cid(2), cid(3), cid(1), cid(2), cid(3)]
        );
    }

    #[test]
    fn mark_active_is_idempotent() {
        let mut mux = CircuitMux::new();
        mux.mark_active(cid(1));
        mux.mark_active(cid(1));
        assert_eq!(mux.active_count(), 1);
    }

    #[test]
    fn destroy_cells_bypass_data_fairness() {
        let mut mux = CircuitMux::new();
        mux.mark_active(cid(1));
        mux.mark_active(cid(2));
        let destroy_cell =
            AnyChanCell::new(Some(cid(9)), tor_cell::chancell::msg::AnyChanMsg::Padding(Default::default()));
        mux.queue_destroy(cid(9), destroy_cell);

        assert!(!mux.is_idle());
        let (id, _) = mux.pop_destroy().unwrap();
        assert_eq!(id, cid(9));
        assert!(mux.pop_destroy().is_none());
        // data fairness is untouched by the destroy fast path
        assert_eq!(mux.active_count(), 2);
    }

    #[test]
    fn mark_inactive_removes_from_rotation() {
        let mut mux = CircuitMux::new();
        mux.mark_active(cid(1));
        mux.mark_active(cid(2));
        mux.mark_inactive(cid(1));
        assert_eq!(mux.next_active(), Some(cid(2)));
        assert_eq!(mux.next_active(), Some(cid(2)));
    }
}
