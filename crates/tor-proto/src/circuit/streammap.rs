//! Types and code for mapping StreamIDs to streams on a circuit.

use crate::circuit::halfstream::HalfStream;
use crate::circuit::StreamMpscReceiver;
use crate::congestion::sendme;
use crate::stream::flow_ctrl::state::{FlowCtrlHooks, StreamFlowCtrl};
use crate::stream::queue::StreamQueueSender;
use crate::stream::AnyCmdChecker;
use crate::{Error, Result};
use tor_cell::relaycell::flow_ctrl::{Xoff, Xon, XonKbpsEwma};
use tor_cell::relaycell::UnparsedRelayMsg;
/// Mapping from stream ID to streams.
// NOTE: This is a work in progress and I bet I'll refactor it a lot;
// it needs to stay opaque!
use tor_cell::relaycell::{msg::AnyRelayMsg, RelayCmd, StreamId};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Instant;
use tor_error::internal;

use rand::Rng;

use crate::congestion::sendme::{StreamParams, StreamRecvWindow};
use safelog::sensitive as sv;
use tor_async_utils::{SinkTrySend as _, SinkTrySendError as _};
use tracing::debug;

/// Why a stream is being torn down from this side of the circuit.
///
/// Purely informational: it doesn't change how the half-stream is tracked,
/// only what ends up in debug logs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TerminateReason {
    /// The application handle for the stream (e.g. a `DataStream`) was dropped.
    StreamTargetClosed,
    /// We're explicitly ending the stream (for example, after an
    /// irrecoverable protocol error local to that stream).
    ExplicitEnd,
    /// The circuit reactor is shutting down.
    ReactorShutdown,
}

/// The entry for a stream.
pub(super) enum StreamEnt {
    /// An open stream.
    Open {
        /// Sink to send relay cells tagged for this stream into.
        sink: StreamQueueSender,
        /// Stream for cells that should be sent down this stream.
        rx: StreamMpscReceiver<AnyRelayMsg>,
        /// Stream-level flow control, for congestion control purposes.
        flow_ctrl: StreamFlowCtrl,
        /// Number of cells dropped due to the stream disappearing before we can
        /// transform this into an `EndSent`.
        dropped: u16,
        /// A `CmdChecker` used to tell whether cells on this stream are valid.
        cmd_checker: AnyCmdChecker,
    },
    /// A stream for which we have received an END cell, but not yet
    /// had the stream object get dropped.
    EndReceived,
    /// A stream for which we have sent an END cell but not yet received an END
    /// cell.
    ///
    /// The `Instant` is when we stop waiting for that END cell and forget
    /// about the stream outright.
    ///
    /// TODO(arti#264) Can we ever throw this out? Do we really get END cells for
    /// these?
    EndSent(HalfStream, Instant),
}

impl StreamEnt {
    /// Retrieve the flow-control state for this stream, if it is open.
    pub(super) fn flow_ctrl(&mut self) -> Option<&mut StreamFlowCtrl> {
        match self {
            StreamEnt::Open {
                ref mut flow_ctrl, ..
            } => Some(flow_ctrl),
            _ => None,
        }
    }
}

/// Return value to indicate whether or not we send an END cell upon
/// terminating a given stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum ShouldSendEnd {
    /// An END cell should be sent.
    Send,
    /// An END cell should not be sent.
    DontSend,
}

/// A map from stream IDs to stream entries. Each circuit has one for each
/// hop.
pub(super) struct StreamMap {
    /// Map from StreamId to StreamEnt.  If there is no entry for a
    /// StreamId, that stream doesn't exist.
    m: HashMap<StreamId, StreamEnt>,
    /// The next StreamId that we should use for a newly allocated
    /// circuit.  (0 is not a valid streamID).
    next_stream_id: u16,
    /// A message dequeued by [`Self::poll_ready_streams_iter`] but not yet
    /// claimed by [`Self::take_ready_msg`].
    pending_ready: Option<(StreamId, AnyRelayMsg)>,
}

impl StreamMap {
    /// Make a new empty StreamMap.
    pub(super) fn new() -> Self {
        let mut rng = rand::thread_rng();
        let next_stream_id: u16 = loop {
            let v: u16 = rng.gen();
            if v != 0 {
                break v;
            }
        };
        StreamMap {
            m: HashMap::new(),
            pending_ready: None,
            next_stream_id,
        }
    }

    /// Get the `HashMap` inside this stream map.
    pub(super) fn inner(&mut self) -> &mut HashMap<StreamId, StreamEnt> {
        &mut self.m
    }

    /// Return the number of currently open streams.
    pub(super) fn n_open_streams(&self) -> usize {
        self.m
            .values()
            .filter(|e| matches!(e, StreamEnt::Open { .. }))
            .count()
    }

    /// Poll the open streams in this map for one that has a message ready to
    /// be sent down the circuit.
    ///
    /// Stops at the first ready stream it finds, stashing the dequeued
    /// message in `self.pending_ready` so that it isn't lost; a later call to
    /// [`Self::take_ready_msg`] with the same `StreamId` claims it. Polling
    /// every stream eagerly on each call would mean throwing away whichever
    /// messages didn't get claimed before the next call, so we only ever
    /// advance one stream's reader per call.
    ///
    /// Returns `Some((id, Some(())))` if stream `id` has a message waiting in
    /// `self.pending_ready`, or `Some((id, None))` if stream `id`'s sender
    /// side has closed. Returns `None` if no stream is currently ready.
    pub(super) fn poll_ready_streams_iter(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> impl Iterator<Item = (StreamId, Option<()>)> + '_ {
        use futures::Stream as _;
        use std::task::Poll;

        let mut found = None;
        if self.pending_ready.is_none() {
            for (id, ent) in self.m.iter_mut() {
                let StreamEnt::Open { rx, .. } = ent else {
                    continue;
                };
                match Pin::new(rx).poll_next(cx) {
                    Poll::Ready(Some(msg)) => {
                        found = Some((*id, Some(msg)));
                        break;
                    }
                    Poll::Ready(None) => {
                        found = Some((*id, None));
                        break;
                    }
                    Poll::Pending => continue,
                }
            }
        }

        let item = found.map(|(id, msg)| match msg {
            Some(msg) => {
                self.pending_ready = Some((id, msg));
                (id, Some(()))
            }
            None => (id, None),
        });
        item.into_iter()
    }

    /// Claim the message stashed by [`Self::poll_ready_streams_iter`] for
    /// `id`, if any.
    pub(super) fn take_ready_msg(&mut self, id: StreamId) -> Option<AnyRelayMsg> {
        match self.pending_ready.take() {
            Some((pending_id, msg)) if pending_id == id => Some(msg),
            other => {
                self.pending_ready = other;
                None
            }
        }
    }

    /// Add an entry to this map; return the newly allocated StreamId.
    pub(super) fn add_ent(
        &mut self,
        sink: StreamQueueSender,
        rx: StreamMpscReceiver<AnyRelayMsg>,
        flow_ctrl: StreamFlowCtrl,
        cmd_checker: AnyCmdChecker,
    ) -> Result<StreamId> {
        let stream_ent = StreamEnt::Open {
            sink,
            rx,
            flow_ctrl,
            dropped: 0,
            cmd_checker,
        };
        // This "65536" seems too aggressive, but it's what tor does.
        //
        // Also, going around in a loop here is (sadly) needed in order
        // to look like Tor clients.
        for _ in 1..=65536 {
            let id: StreamId = self.next_stream_id.into();
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            if id.is_zero() {
                continue;
            }
            let ent = self.m.entry(id);
            if let Entry::Vacant(_) = ent {
                ent.or_insert(stream_ent);
                return Ok(id);
            }
        }

        Err(Error::IdRangeFull)
    }

    /// Add an entry to this map using the specified StreamId, as chosen by the
    /// other side of the circuit (used for incoming streams at an exit or
    /// onion service).
    ///
    /// Gives an error if the id is already in use.
    pub(super) fn add_ent_with_id(
        &mut self,
        sink: StreamQueueSender,
        rx: StreamMpscReceiver<AnyRelayMsg>,
        flow_ctrl: StreamFlowCtrl,
        stream_id: StreamId,
        cmd_checker: AnyCmdChecker,
    ) -> Result<()> {
        let stream_ent = StreamEnt::Open {
            sink,
            rx,
            flow_ctrl,
            dropped: 0,
            cmd_checker,
        };
        match self.m.entry(stream_id) {
            Entry::Occupied(_) => Err(Error::CircProto(
                "Tried to use a stream ID that's already in use".into(),
            )),
            Entry::Vacant(v) => {
                v.insert(stream_ent);
                Ok(())
            }
        }
    }

    /// Return the entry for `id` in this map, if any.
    pub(super) fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamEnt> {
        self.m.get_mut(&id)
    }

    /// Note that we received an END message (or other message indicating the end of
    /// the stream) on the stream with `id`.
    ///
    /// Returns true if there was really a stream there.
    pub(super) fn ending_msg_received(&mut self, id: StreamId) -> Result<()> {
        // Check the hashmap for the right stream. Bail if not found.
        // Also keep the hashmap handle so that we can do more efficient inserts/removals
        let mut stream_entry = match self.m.entry(id) {
            Entry::Vacant(_) => {
                return Err(Error::CircProto(
                    "Received END cell on nonexistent stream".into(),
                ))
            }
            Entry::Occupied(o) => o,
        };

        // Progress the stream's state machine accordingly
        match stream_entry.get() {
            StreamEnt::EndReceived => Err(Error::CircProto(
                "Received two END cells on same stream".into(),
            )),
            StreamEnt::EndSent(..) => {
                debug!("Actually got an end cell on a half-closed stream!");
                // We got an END, and we already sent an END. Great!
                // we can forget about this stream.
                stream_entry.remove_entry();
                Ok(())
            }
            StreamEnt::Open { .. } => {
                stream_entry.insert(StreamEnt::EndReceived);
                Ok(())
            }
        }
    }

    /// Handle a termination of the stream with `id` from this side of
    /// the circuit. Return whether an END ought to be sent.
    ///
    /// If the stream was open, it becomes a half-stream that expires at
    /// `expiry`, so that a few stray cells arriving just after our END don't
    /// look like a protocol violation.
    pub(super) fn terminate(
        &mut self,
        id: StreamId,
        why: TerminateReason,
        expiry: Instant,
    ) -> Result<ShouldSendEnd> {
        debug!(stream_id = %id, reason = ?why, "terminating stream");
        // Progress the stream's state machine accordingly
        match self
            .m
            .remove(&id)
            .ok_or_else(|| Error::from(internal!("Somehow we terminated a nonexistent stream?")))?
        {
            StreamEnt::EndReceived => Ok(ShouldSendEnd::DontSend),
            StreamEnt::Open {
                flow_ctrl,
                dropped,
                // notably absent: the channels for sink and stream, which will get dropped and
                // closed (meaning reads/writes from/to this stream will now fail);
                // also absent: cmd_checker, whose job HalfStream::handle_msg takes over
                // directly once a stream is half-closed.
                ..
            } => {
                // FIXME(eta): we don't copy the receive window, instead just creating a new one,
                //             so a malicious peer can send us slightly more data than they should
                //             be able to; see arti#230.
                let mut recv_window = StreamRecvWindow::new(StreamParams::start());
                for _ in 0..dropped {
                    recv_window.take()?;
                }
                let send_window = flow_ctrl.into_send_window();
                let halfstream = HalfStream::new(send_window, recv_window, true);
                self.m.insert(id, StreamEnt::EndSent(halfstream, expiry));
                Ok(ShouldSendEnd::Send)
            }
            StreamEnt::EndSent(..) => {
                panic!("Hang on! We're sending an END on a stream where we already sent an END‽");
            }
        }
    }

    /// Remove every half-closed stream whose expiry has passed as of `now`.
    pub(super) fn remove_expired_halfstreams(&mut self, now: Instant) {
        self.m
            .retain(|_, ent| !matches!(ent, StreamEnt::EndSent(_, expiry) if now >= *expiry));
    }

    /// Handle an incoming RELAY message addressed to `streamid`.
    ///
    /// Returns the message back to the caller if it's an incoming stream
    /// request (a `None` entry receiving `BEGIN`/`BEGIN_DIR`/`RESOLVE`) that
    /// needs to be handled by relay- or onion-service-specific code.
    pub(super) fn handle_msg(
        &mut self,
        err_fn: impl Fn(StreamId) -> Error,
        cell_counts_toward_windows: bool,
        streamid: StreamId,
        msg: UnparsedRelayMsg,
        now: Instant,
    ) -> Result<Option<UnparsedRelayMsg>> {
        match self.m.get_mut(&streamid) {
            Some(StreamEnt::Open { .. }) => {
                let message_closes_stream = Self::deliver_msg_to_stream(
                    streamid,
                    self.m
                        .get_mut(&streamid)
                        .expect("stream vanished under us"),
                    cell_counts_toward_windows,
                    msg,
                )?;
                if message_closes_stream {
                    self.ending_msg_received(streamid)?;
                }
                Ok(None)
            }
            Some(StreamEnt::EndSent(_, expiry)) if now >= *expiry => Err(err_fn(streamid)),
            #[cfg(any(feature = "hs-service", feature = "relay"))]
            Some(StreamEnt::EndSent(..))
                if matches!(
                    msg.cmd(),
                    RelayCmd::BEGIN | RelayCmd::BEGIN_DIR | RelayCmd::RESOLVE
                ) =>
            {
                // The other side is sending us a BEGIN but hasn't yet
                // acknowledged our END; drop the half-stream and let the
                // new request through.
                self.ending_msg_received(streamid)?;
                Ok(Some(msg))
            }
            Some(StreamEnt::EndSent(half_stream, _)) => {
                match half_stream.handle_msg(msg)? {
                    super::halfstream::HalfStreamStatus::Open => {}
                    super::halfstream::HalfStreamStatus::Closed => {
                        self.ending_msg_received(streamid)?;
                    }
                }
                Ok(None)
            }
            #[cfg(any(feature = "hs-service", feature = "relay"))]
            None if matches!(
                msg.cmd(),
                RelayCmd::BEGIN | RelayCmd::BEGIN_DIR | RelayCmd::RESOLVE
            ) =>
            {
                Ok(Some(msg))
            }
            _ => Err(err_fn(streamid)),
        }
    }

    /// Deliver `msg` to the open stream entry at `ent`, handling stream-level
    /// SENDME/XON/XOFF messages here rather than in the stream's own `recv()`.
    ///
    /// Returns whether the message closes the stream.
    fn deliver_msg_to_stream(
        streamid: StreamId,
        ent: &mut StreamEnt,
        cell_counts_toward_windows: bool,
        msg: UnparsedRelayMsg,
    ) -> Result<bool> {
        let StreamEnt::Open {
            sink,
            flow_ctrl,
            dropped,
            cmd_checker,
            ..
        } = ent
        else {
            return Err(internal!("deliver_msg_to_stream called on a non-open stream").into());
        };

        match msg.cmd() {
            RelayCmd::SENDME => {
                flow_ctrl.put_for_incoming_sendme(msg)?;
                return Ok(false);
            }
            RelayCmd::XON => {
                flow_ctrl.handle_incoming_xon(msg)?;
                return Ok(false);
            }
            RelayCmd::XOFF => {
                flow_ctrl.handle_incoming_xoff(msg)?;
                return Ok(false);
            }
            _ => {}
        }

        let message_closes_stream =
            cmd_checker.check_msg(&msg)? == crate::stream::cmdcheck::StreamStatus::Closed;

        if let Err(e) = Pin::new(sink).try_send(msg) {
            if e.is_full() {
                return Err(Error::CircProto(format!(
                    "Stream sink would block; received too many cells on stream ID {}",
                    sv(streamid),
                )));
            }
            if e.is_disconnected() && cell_counts_toward_windows {
                // the other side of the stream has gone away; remember
                // that we received a cell that we couldn't queue for it.
                //
                // Later this value will be recorded in a half-stream.
                *dropped += 1;
            }
        }

        Ok(message_closes_stream)
    }

    /// Inform the flow control code for `stream_id` that we're about to send
    /// `msg`.
    pub(super) fn about_to_send(&mut self, stream_id: StreamId, msg: &AnyRelayMsg) -> Result<()> {
        let Some(ent) = self.get_mut(stream_id) else {
            return Err(Error::CircProto(format!(
                "tried to send a relay cell on non-open stream {}",
                sv(stream_id),
            )));
        };
        let Some(flow_ctrl) = ent.flow_ctrl() else {
            return Err(Error::CircProto(format!(
                "tried to send a relay cell on non-open stream {}",
                sv(stream_id),
            )));
        };
        flow_ctrl.about_to_send(msg)
    }

    /// Check if we should send an XON message for `id`.
    pub(super) fn maybe_send_xon(&mut self, rate: XonKbpsEwma, id: StreamId) -> Result<Option<Xon>> {
        let Some(ent) = self.get_mut(id) else {
            return Ok(None);
        };
        let Some(flow_ctrl) = ent.flow_ctrl() else {
            return Ok(None);
        };
        // buffer_len isn't tracked independently here; the xon/xoff flow
        // control state keeps its own accounting via the drain-rate channel.
        flow_ctrl.maybe_send_xon(rate, 0)
    }

    /// Check if we should send an XOFF message for `id`.
    pub(super) fn maybe_send_xoff(&mut self, id: StreamId) -> Result<Option<Xoff>> {
        let Some(ent) = self.get_mut(id) else {
            return Ok(None);
        };
        let Some(flow_ctrl) = ent.flow_ctrl() else {
            return Ok(None);
        };
        flow_ctrl.maybe_send_xoff(0)
    }

    // TODO: Eventually if we want relay support, we'll need to support
    // stream IDs chosen by somebody else. But for now, we don't need those.
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::congestion::sendme::StreamSendWindow;
    use crate::stream::cmdcheck::test_support::any_cmd_checker;
    use crate::stream::queue::fake_stream_queue;
    use std::time::Duration;

    fn window_flow_ctrl(n: u16) -> StreamFlowCtrl {
        StreamFlowCtrl::new_window(StreamSendWindow::new(n))
    }

    #[test]
    fn streammap_basics() -> Result<()> {
        let mut map = StreamMap::new();
        let mut next_id = map.next_stream_id;
        let mut ids = Vec::new();

        // Try add_ent
        for _ in 0..128 {
            let (sink, _) = fake_stream_queue(128);
            let (_, rx) = crate::fake_mpsc(2);
            let id = map.add_ent(sink, rx, window_flow_ctrl(500), any_cmd_checker())?;
            let expect_id: StreamId = next_id.into();
            assert_eq!(expect_id, id);
            next_id = next_id.wrapping_add(1);
            if next_id == 0 {
                next_id = 1;
            }
            ids.push(id);
        }

        // Test get_mut.
        let nonesuch_id = next_id.into();
        assert!(matches!(map.get_mut(ids[0]), Some(StreamEnt::Open { .. })));
        assert!(map.get_mut(nonesuch_id).is_none());

        // Test end_received
        assert!(map.ending_msg_received(nonesuch_id).is_err());
        assert!(map.ending_msg_received(ids[1]).is_ok());
        assert!(matches!(map.get_mut(ids[1]), Some(StreamEnt::EndReceived)));
        assert!(map.ending_msg_received(ids[1]).is_err());

        // Test terminate
        let expiry = Instant::now() + Duration::from_secs(60);
        assert!(map
            .terminate(nonesuch_id, TerminateReason::ExplicitEnd, expiry)
            .is_err());
        assert_eq!(
            map.terminate(ids[2], TerminateReason::ExplicitEnd, expiry)?,
            ShouldSendEnd::Send
        );
        assert!(matches!(map.get_mut(ids[2]), Some(StreamEnt::EndSent(..))));
        assert_eq!(
            map.terminate(ids[1], TerminateReason::ExplicitEnd, expiry)?,
            ShouldSendEnd::DontSend
        );
        assert!(map.get_mut(ids[1]).is_none());

        // Try receiving an end after a terminate.
        assert!(map.ending_msg_received(ids[2]).is_ok());
        assert!(map.get_mut(ids[2]).is_none());

        Ok(())
    }

    #[test]
    fn expired_halfstreams_are_reaped() -> Result<()> {
        let mut map = StreamMap::new();
        let (sink, _) = fake_stream_queue(128);
        let (_, rx) = crate::fake_mpsc(2);
        let id = map.add_ent(sink, rx, window_flow_ctrl(500), any_cmd_checker())?;

        let past = Instant::now() - Duration::from_secs(1);
        map.terminate(id, TerminateReason::ExplicitEnd, past)?;
        assert!(map.get_mut(id).is_some());

        map.remove_expired_halfstreams(Instant::now());
        assert!(map.get_mut(id).is_none());

        Ok(())
    }
}
