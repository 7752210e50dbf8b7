//! Concrete relay-role glue: wires [`super::dispatch`], [`super::circuit_table`],
//! [`super::mux`], [`super::cell_queue`], [`super::create`] and
//! [`super::onionskin`] together into something a running channel reactor
//! can actually call.
//!
//! [`RelayChannelState`] is the per-channel relay-role state: the circuit
//! table scoped to this channel, the fairness scheduler for this channel's
//! outbound cells, and one [`CellQueue`]/[`RelayEarlyBudget`] per open
//! circuit. `channel::reactor::Reactor::handle_cell` holds one of these per
//! relay-mode channel and calls into it for `CREATE*`, `RELAY_EARLY`, and
//! `DESTROY` cells.
//!
//! What this does *not* do: decrypt/recognize/forward a `RELAY` cell once a
//! circuit is open (§4.7's hot path), or extend a circuit onward to a next
//! hop. Those require a concrete relay [`ForwardHandler`](crate::circuit::reactor::forward::ForwardHandler)/
//! [`BackwardHandler`](crate::circuit::reactor::backward::BackwardHandler)
//! pair driving [`crate::circuit::reactor::Reactor`], which nothing in this
//! crate currently instantiates for either role (see `DESIGN.md`). This
//! module only covers what a relay does *before* that per-circuit reactor
//! would exist: accepting or refusing the `CREATE*` that creates it, and
//! scheduling/tearing down its channel-level queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use coarsetime::Instant;
use tor_cell::chancell::msg::{AnyChanMsg, Destroy, DestroyReason};
use tor_cell::chancell::{AnyChanCell, CircId};
use tor_error::internal;
use tor_memquota::mtracker::{IsParticipant, Participation, Reclaimed, ReclaimFuture};
use tor_memquota::EnabledToken;
use tor_rtcompat::CoarseInstant;
use void::ResultVoidExt as _;

use crate::memquota::{ChannelAccount, CircuitAccount, SpecificAccount as _};
use crate::relay::cell_queue::{CellQueue, CellQueueParams, PushOutcome};
use crate::relay::circuit_table::{CircuitKey, CircuitTable};
use crate::relay::create::{CreateRequest, onionskin_supported, reply_wrap_for};
use crate::relay::dispatch::{
    CreateContext, Direction, RelayEarlyBudget, RelayEarlyOutcome, validate_create,
};
use crate::relay::mux::CircuitMux;
use crate::relay::onionskin::{CreateTask, OnionskinResponder};
use crate::{Error, Result};
use crate::channel::UniqId as ChannelUniqId;

/// Rough per-cell size charged to the memory quota tracker, matching the
/// fixed 514-byte wire cell (see `channel/codec.rs`'s encoding tests).
const CHAN_CELL_QUOTA: usize = 514;

/// [`IsParticipant`] for one relay circuit's outbound cell queue.
///
/// Registered once per circuit in [`RelayChannelState::handle_create`], so
/// that `tor_memquota`'s reclaim sweep (§4.13's cell-OOM handler) ranks
/// circuits by the age of their oldest queued cell and can close the oldest
/// one down on its own, without the memory governor needing to know
/// anything about cell queues.
#[derive(Debug)]
struct RelayCircuitParticipant {
    /// The queue this participant reports on and clears on reclaim.
    queue: Arc<Mutex<CellQueue>>,
    /// Set by [`Self::reclaim`]; polled by [`RelayChannelState`]'s normal
    /// synchronous methods to notice a circuit the tracker has collapsed
    /// and actually tear it down (send `DESTROY`, drop its table entry).
    reclaimed: Arc<AtomicBool>,
}

impl IsParticipant for RelayCircuitParticipant {
    fn get_oldest(&self, _: EnabledToken) -> Option<CoarseInstant> {
        let queue = self.queue.lock().expect("cell queue lock poisoned");
        queue.oldest_insertion().map(CoarseInstant::from)
    }

    fn reclaim(self: Arc<Self>, _: EnabledToken) -> ReclaimFuture {
        self.queue
            .lock()
            .expect("cell queue lock poisoned")
            .clear();
        self.reclaimed.store(true, Ordering::Release);
        Box::pin(async { Reclaimed::Collapsing })
    }
}

/// Per-circuit state a relay keeps once a `CREATE*` cell has been accepted.
struct RelayCircuit {
    /// Outbound cell queue towards the other half-circuit.
    ///
    /// Shared with this circuit's [`RelayCircuitParticipant`] so the memory
    /// governor's reclaim callback can clear it directly.
    queue: Arc<Mutex<CellQueue>>,
    /// Remaining `RELAY_EARLY` budget for this circuit (§4.6).
    early_budget: RelayEarlyBudget,
    /// Set once `tor_memquota` has reclaimed this circuit's queue; the
    /// circuit must be torn down at the next opportunity (§4.13).
    reclaimed: Arc<AtomicBool>,
    /// Keeps this circuit's participant alive; `tor_memquota` only holds a
    /// `Weak` reference to it, so dropping this would silently unregister
    /// the circuit from memory tracking.
    _participant: Arc<RelayCircuitParticipant>,
    /// Tracks this circuit's claimed share of the memory quota. Claimed on
    /// push, released on pop, so the tracker's global total reflects what
    /// this queue actually holds.
    participation: Participation,
}

/// Per-channel relay-role state.
///
/// A relay runs one of these per channel it has open; it owns the circuit
/// table, the fairness scheduler, and every open relay circuit's queue and
/// budget on that channel.
pub(crate) struct RelayChannelState {
    /// Circuits keyed by `(channel, circuit-id)`, scoped to this channel.
    circuits: CircuitTable<RelayCircuit>,
    /// Fairness scheduler for this channel's outbound cells.
    mux: CircuitMux,
    /// Answers the server side of `CREATE*` handshakes.
    responder: Arc<dyn OnionskinResponder + Send + Sync>,
    /// Whether this channel allocates circuit ids from the high partition
    /// (see [`super::dispatch::partition_matches`]).
    expect_high_partition: bool,
    /// Whether the peer on this channel is a client (vs. another relay).
    peer_is_client: bool,
    /// Parent account each open circuit's memory-quota participant is
    /// registered under (§4.13).
    channel_account: ChannelAccount,
}

impl RelayChannelState {
    /// Construct fresh relay state for a newly opened channel.
    pub(crate) fn new(
        responder: Arc<dyn OnionskinResponder + Send + Sync>,
        expect_high_partition: bool,
        peer_is_client: bool,
        channel_account: ChannelAccount,
    ) -> Self {
        Self {
            circuits: CircuitTable::new(),
            mux: CircuitMux::new(),
            responder,
            expect_high_partition,
            peer_is_client,
            channel_account,
        }
    }

    /// Handle an inbound `CREATE`/`CREATE_FAST`/`CREATE2` cell.
    ///
    /// On success, registers the new circuit in the table and mux and
    /// returns the `CREATED*` cell to send back. On a rejection the spec
    /// treats as non-fatal to the channel (§4.6), returns `Ok(None)`: the
    /// caller should drop the cell and log, not tear down the channel. On a
    /// handshake failure, returns the `DESTROY` cell to send instead.
    pub(crate) async fn handle_create(
        &mut self,
        channel: ChannelUniqId,
        circ_id: Option<CircId>,
        server_mode: bool,
        msg: AnyChanMsg,
        now: CoarseInstant,
    ) -> Result<Option<AnyChanCell>> {
        let req = CreateRequest::try_from(msg)?;

        let ctx = CreateContext {
            circ_id,
            id_in_use: circ_id
                .map(|id| self.circuits.contains(&CircuitKey::new(channel, id)))
                .unwrap_or(false),
            server_mode,
            peer_is_client: self.peer_is_client,
            expect_high_partition: self.expect_high_partition,
            onionskin_supported: onionskin_supported(&req),
        };

        let circ_id = match validate_create(&ctx) {
            Ok(id) => id,
            Err(rejection) => {
                tracing::debug!(?rejection, "refusing CREATE* cell");
                return Ok(None);
            }
        };

        let task = CreateTask {
            handshake_type: req.handshake_type(),
            handshake_body: req.handshake_body().to_vec(),
        };

        let outcome = match self.responder.answer_create(task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(error = %e, "CREATE* handshake failed, sending DESTROY");
                let destroy = Destroy::new(DestroyReason::PROTOCOL);
                return Ok(Some(AnyChanCell::new(Some(circ_id), destroy.into())));
            }
        };

        let wrap = reply_wrap_for(&req);
        let reply = wrap.to_chanmsg(outcome.reply_body);

        let circuit_account = CircuitAccount::new(&self.channel_account)
            .map_err(|e| Error::from(internal!("failed to open circuit memory account: {e}")))?;
        let queue = Arc::new(Mutex::new(CellQueue::new(CellQueueParams::default())));
        let reclaimed = Arc::new(AtomicBool::new(false));
        let (participant, participation) = circuit_account
            .as_raw_account()
            .register_participant_with(now, |partn| {
                Ok::<_, void::Void>((
                    Arc::new(RelayCircuitParticipant {
                        queue: queue.clone(),
                        reclaimed: reclaimed.clone(),
                    }),
                    partn,
                ))
            })
            .map_err(|e| Error::from(internal!("failed to register circuit memory participant: {e}")))?
            .void_unwrap();

        let key = CircuitKey::new(channel, circ_id);
        self.circuits
            .insert(
                key,
                RelayCircuit {
                    queue,
                    early_budget: RelayEarlyBudget::default(),
                    reclaimed,
                    _participant: participant,
                    participation,
                },
            )
            .map_err(|_| Error::from(internal!("duplicate circuit id slipped past validate_create")))?;
        self.mux.mark_active(circ_id);

        Ok(Some(AnyChanCell::new(Some(circ_id), reply)))
    }

    /// Check (and consume) `RELAY_EARLY` budget for a cell travelling in
    /// `direction` on `circ_id`. Returns `None` if the circuit is unknown.
    pub(crate) fn check_relay_early(
        &mut self,
        channel: ChannelUniqId,
        circ_id: CircId,
        direction: Direction,
    ) -> Option<RelayEarlyOutcome> {
        let key = CircuitKey::new(channel, circ_id);
        let circuit = self.circuits.get_mut(&key)?;
        Some(circuit.early_budget.check(direction))
    }

    /// Queue a packed cell for outbound delivery on `circ_id`, marking the
    /// circuit active in the fairness scheduler. Returns `None` if the
    /// circuit is unknown.
    pub(crate) fn queue_outbound(
        &mut self,
        channel: ChannelUniqId,
        circ_id: CircId,
        cell: AnyChanCell,
    ) -> Option<PushOutcome> {
        let key = CircuitKey::new(channel, circ_id);
        let circuit = self.circuits.get_mut(&key)?;
        let outcome = circuit
            .queue
            .lock()
            .expect("cell queue lock poisoned")
            .push_packed(cell, Instant::now());
        let _ = circuit.participation.claim(CHAN_CELL_QUOTA);
        self.mux.mark_active(circ_id);
        Some(outcome)
    }

    /// Pop the next outbound cell this channel should send, draining
    /// `DESTROY`s ahead of ordinary data traffic (§4.5).
    pub(crate) fn next_outbound(&mut self, channel: ChannelUniqId) -> Option<AnyChanCell> {
        if let Some((_circ_id, cell)) = self.mux.pop_destroy() {
            return Some(cell);
        }
        let circ_id = self.mux.next_active()?;
        let key = CircuitKey::new(channel, circ_id);
        let circuit = self.circuits.get_mut(&key)?;
        let (cell, is_empty) = {
            let mut queue = circuit.queue.lock().expect("cell queue lock poisoned");
            let (cell, _outcome) = queue.pop();
            (cell, queue.is_empty())
        };
        if cell.is_some() {
            circuit.participation.release(CHAN_CELL_QUOTA);
        }
        if is_empty {
            self.mux.mark_inactive(circ_id);
        }
        cell
    }

    /// Circuit ids, on this channel, that `tor_memquota` has reclaimed
    /// since the last call (§4.13). The caller (the channel reactor) must
    /// send each one a `DESTROY` and drop it via [`Self::remove`].
    pub(crate) fn take_reclaimed_circuits(&self, channel: ChannelUniqId) -> Vec<CircId> {
        self.circuits
            .iter()
            .filter(|(key, circuit)| {
                key.channel() == channel && circuit.reclaimed.load(Ordering::Acquire)
            })
            .map(|(key, _)| key.circ_id())
            .collect()
    }

    /// Tear down a circuit: remove it from the table and the mux, dropping
    /// any cells still queued for it.
    pub(crate) fn remove(&mut self, channel: ChannelUniqId, circ_id: CircId) {
        let key = CircuitKey::new(channel, circ_id);
        if let Some(circuit) = self.circuits.remove(&key) {
            circuit.queue.lock().expect("cell queue lock poisoned").clear();
        }
        self.mux.mark_inactive(circ_id);
    }

    /// The circuit, on this channel, whose oldest queued cell is oldest,
    /// and that insertion time.
    ///
    /// Superseded as the memory governor's actual victim-selection path by
    /// [`RelayCircuitParticipant`]'s registration with `tor_memquota` (the
    /// tracker now ranks every relay's circuits together, not just those on
    /// one channel); kept for introspection/tests and as the in-process
    /// fallback a channel can consult on its own backlog.
    pub(crate) fn oldest_queued_circuit(&self) -> Option<(CircId, Instant)> {
        self.circuits
            .iter()
            .filter_map(|(key, circuit)| {
                circuit
                    .queue
                    .lock()
                    .expect("cell queue lock poisoned")
                    .oldest_insertion()
                    .map(|t| (key.circ_id(), t))
            })
            .min_by_key(|(_, t)| *t)
    }
}
