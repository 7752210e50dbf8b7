//! Circuit padding
//!
//! A full padding-machine implementation (driven by something like
//! [`maybenot`](https://crates.io/crates/maybenot)) is out of scope here;
//! [`PaddingController`] and [`PaddingEventStream`] are no-ops, and the
//! latter never yields. The API shape is kept so that the circuit reactor
//! can call these methods unconditionally whether or not a padding
//! machine is ever wired in.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use tor_memquota::memory_cost_structural_copy;
use tor_rtcompat::{DynTimeProvider, SleepProvider};

use crate::util::err::ExcessPadding;
use crate::HopNum;

#[cfg(feature = "circ-padding")]
use {crate::circuit::cell_sender::CircuitCellSender, crate::client::circuit::padding};

/// An instruction from the padding machine to the circuit.
///
/// These are returned from the [`PaddingEventStream`]. Since no padding
/// machine is ever installed, none of these are ever actually constructed.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PaddingEvent {
    /// An instruction to send padding.
    SendPadding(SendPadding),
    /// An instruction to start blocking outbound traffic,
    /// or change the hop at which traffic is blocked.
    StartBlocking(StartBlocking),
    /// An instruction to stop all blocking.
    StopBlocking,
}

/// Used to report padding events to the (absent) padding subsystem.
#[derive(Clone, Debug)]
pub(crate) struct PaddingController<S: SleepProvider = DynTimeProvider> {
    /// Marker, to pretend that we use a runtime.
    _phantom: PhantomData<S>,
}

/// Indication that padding should be sent.
///
/// Uninhabited and unconstructable: no padding machine ever runs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SendPadding(void::Void);

/// Information about a queued cell that we need to feed back into the
/// padding subsystem.
#[derive(Clone, Copy, Debug)]
pub(crate) struct QueuedCellPaddingInfo(void::Void);
memory_cost_structural_copy!(QueuedCellPaddingInfo);

/// Indication that we should begin blocking traffic to a given hop,
/// or change the hop to which we're blocking traffic.
///
/// Uninhabited and unconstructable: no padding machine ever runs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StartBlocking(void::Void);

impl<S: SleepProvider> PaddingController<S> {
    /// Report that we've enqueued a non-padding cell for a given hop.
    pub(crate) fn queued_data(&self, _hop: HopNum) -> Option<QueuedCellPaddingInfo> {
        None
    }

    /// Report that we have enqueued a non-padding cell
    /// in place of a replaceable padding cell
    /// for a given hop.
    pub(crate) fn queued_data_as_padding(
        &self,
        _hop: HopNum,
        sendpadding: SendPadding,
    ) -> Option<QueuedCellPaddingInfo> {
        void::unreachable(sendpadding.0);
    }

    /// Report that we have enqueued a padding cell to a given hop.
    pub(crate) fn queued_padding(
        &self,
        _hop: HopNum,
        sendpadding: SendPadding,
    ) -> Option<QueuedCellPaddingInfo> {
        void::unreachable(sendpadding.0);
    }

    /// Report that we've flushed a cell from the queue for the given hop.
    pub(crate) fn flushed_relay_cell(&self, _info: QueuedCellPaddingInfo) {}

    /// Report that we've flushed a cell from the per-channel queue.
    pub(crate) fn flushed_channel_cell(&self) {}

    /// Report that we have decrypted a non-padding cell from our queue
    /// from a given hop.
    pub(crate) fn decrypted_data(&self, _hop: HopNum) {}

    /// Report that we have decrypted a padding cell from our queue.
    pub(crate) fn decrypted_padding(&self, hop: HopNum) -> Result<(), crate::Error> {
        Err(crate::Error::ExcessPadding(
            ExcessPadding::NoPaddingNegotiated,
            hop,
        ))
    }
}

/// A stream of [`PaddingEvent`]s. Never yields, since no padding machine
/// is ever installed.
pub(crate) struct PaddingEventStream<S: SleepProvider = DynTimeProvider> {
    /// Marker, to pretend that we use a runtime.
    _phantom: PhantomData<S>,
}

impl<S: SleepProvider> futures::Stream for PaddingEventStream<S> {
    type Item = PaddingEvent;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Pending
    }
}

impl<S: SleepProvider> futures::stream::FusedStream for PaddingEventStream<S> {
    fn is_terminated(&self) -> bool {
        false
    }
}

/// Initialize a new `PaddingController` and `PaddingEventStream`.
///
/// Since no padding machine ever runs, the `runtime` argument is unused.
pub(crate) fn new_padding<S: SleepProvider>(
    runtime: S,
) -> (PaddingController<S>, PaddingEventStream<S>) {
    drop(runtime);
    (
        PaddingController {
            _phantom: PhantomData,
        },
        PaddingEventStream {
            _phantom: PhantomData,
        },
    )
}

/// A possible way to handle a request to send padding.
#[derive(Copy, Clone, Debug)]
pub(crate) enum CircPaddingDisposition {
    /// Enqueue the padding normally.
    QueuePaddingNormally,
    /// Enqueue the padding, and allow one cell of data on our outbound queue
    /// to bypass the current block.
    QueuePaddingAndBypass,
    /// Do not take any actual padding action:
    /// existing data on our outbound queue will count as padding.
    TreatQueuedCellAsPadding,
}

/// Determine how exactly to handle a request to handle padding.
///
/// This is fairly complicated; see the maybenot documentation for more information.
///
// TODO(relay): relays use the same logic as clients here. Is that okay,
// or do they need to handle SendPadding differently??
#[cfg(feature = "circ-padding")]
pub(crate) fn padding_disposition(
    send_padding: &padding::SendPadding,
    chan_sender: &CircuitCellSender,
    padding_block: Option<&padding::StartBlocking>,
) -> CircPaddingDisposition {
    use CircPaddingDisposition::*;
    use padding::Bypass::*;
    use padding::Replace::*;

    // If true, and we are trying to send Replaceable padding,
    // we should let any data in the queue count as the queued padding instead,
    // if it is queued for our target hop (or any subsequent hop).
    //
    // TODO circpad: In addition to letting currently-queued data count as padding,
    // maybenot also permits us to send currently pending data from our streams
    // (or from our next hop, if we're a relay).  We don't have that implemented yet.
    //
    // TODO circpad: This will usually be false, since we try not to queue data
    // when there isn't space to write it.  If we someday add internal per-circuit
    // Buffers to chan_sender, this test is more likely to trigger.
    let have_queued_cell_for_hop = chan_sender.have_queued_cell_for_hop_or_later(send_padding.hop);

    match padding_block {
        Some(blocking) if blocking.is_bypassable => {
            match (
                send_padding.may_replace_with_data(),
                send_padding.may_bypass_block(),
            ) {
                (NotReplaceable, DoNotBypass) => QueuePaddingNormally,
                (NotReplaceable, BypassBlocking) => QueuePaddingAndBypass,
                (Replaceable, DoNotBypass) => {
                    if have_queued_cell_for_hop {
                        TreatQueuedCellAsPadding
                    } else {
                        QueuePaddingNormally
                    }
                }
                (Replaceable, BypassBlocking) => {
                    if have_queued_cell_for_hop {
                        TreatQueuedCellAsPadding
                    } else {
                        QueuePaddingAndBypass
                    }
                }
            }
        }
        Some(_) | None => match send_padding.may_replace_with_data() {
            Replaceable => {
                if have_queued_cell_for_hop {
                    TreatQueuedCellAsPadding
                } else {
                    QueuePaddingNormally
                }
            }
            NotReplaceable => QueuePaddingNormally,
        },
    }
}
