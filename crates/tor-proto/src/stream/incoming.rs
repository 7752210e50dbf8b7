//! Support for streams opened by the other side of a circuit.
//!
//! Used by the client role for onion-service `INTRODUCE`/rendezvous streams,
//! and by the relay role's exit-facing hop for ordinary `BEGIN` requests (see
//! `circuit::reactor::ForwardHandler::handle_forward_cell` and the
//! `AwaitStreamRequests` control command in `circuit::reactor::forward`).

use tor_cell::relaycell::msg::RelayMsg;
use tor_cell::relaycell::{RelayCmd, StreamId, UnparsedRelayMsg};
use tor_cell::restricted_msg;
use tor_memquota::mq_queue;

use crate::circuit::reactor::syncview::ClientCircSyncView;
use crate::memquota::StreamAccount;
use crate::stream::cmdcheck::{AnyCmdChecker, CmdChecker, StreamStatus};
use crate::{Error, HopNum, Result};

use crate::circuit::{StreamMpscReceiver, StreamMpscSender};

restricted_msg! {
    /// The allowed incoming messages on a stream opened by the other side of
    /// a circuit.
    #[derive(Clone, Debug)]
    #[non_exhaustive]
    pub enum IncomingStreamRequest: RelayMsg {
        /// A BEGIN message, requesting a new data stream.
        Begin,
        /// A BEGIN_DIR message, requesting a new directory stream.
        BeginDir,
        /// A RESOLVE message, requesting a hostname lookup.
        Resolve,
    }
}

/// A `CmdChecker` for commands received on a not-yet-accepted incoming
/// stream.
///
/// Accepts only the handful of commands named in [`IncomingStreamRequest`];
/// anything else is a protocol violation.
#[derive(Debug)]
pub(crate) struct IncomingCmdChecker {
    /// Which of the `IncomingStreamRequest` commands this circuit accepts.
    allow_commands: Vec<RelayCmd>,
}

impl IncomingCmdChecker {
    /// Create a new boxed `IncomingCmdChecker` accepting only `allow_commands`.
    pub(crate) fn new_any(allow_commands: &[RelayCmd]) -> AnyCmdChecker {
        Box::new(Self {
            allow_commands: allow_commands.to_vec(),
        })
    }
}

impl CmdChecker for IncomingCmdChecker {
    fn check_msg(&mut self, msg: &UnparsedRelayMsg) -> Result<StreamStatus> {
        if self.allow_commands.contains(&msg.cmd()) {
            Ok(StreamStatus::Open)
        } else {
            Err(Error::StreamProto(format!(
                "Unexpected {} on incoming stream",
                msg.cmd()
            )))
        }
    }

    fn consume_msg(&mut self, msg: UnparsedRelayMsg) -> Result<()> {
        let _ = msg
            .decode::<IncomingStreamRequest>()
            .map_err(|err| Error::from_bytes_err(err, "invalid message on incoming stream"))?;
        Ok(())
    }
}

/// A `CmdChecker` for a stream that this relay opened on the other side's
/// behalf (e.g. the exit connection for a `BEGIN`), checking the replies
/// (`CONNECTED`/`END`/`DATA`/...) that come back on it.
///
/// Grounded on the teacher's `OutboundDataCmdChecker`/`IncomingCmdChecker`
/// pair (`client/stream/data.rs`, `client/stream/incoming.rs`): those enforce
/// the client's view of a stream it originated; this is the mirror image for
/// the relay's view of a stream *it* originated on the exit side, tracking
/// only whether a `CONNECTED` has already been seen.
#[derive(Debug)]
pub(crate) struct InboundDataCmdChecker {
    /// Whether we've already seen a `CONNECTED` reply on this stream.
    connected_received: bool,
}

impl InboundDataCmdChecker {
    /// Create a checker for a stream that has not yet received `CONNECTED`.
    pub(crate) fn new_any() -> AnyCmdChecker {
        Box::new(Self {
            connected_received: false,
        })
    }

    /// Create a checker for a stream that has already been accepted with
    /// `CONNECTED` (used when the exit connection succeeds synchronously).
    pub(crate) fn new_connected() -> AnyCmdChecker {
        Box::new(Self {
            connected_received: true,
        })
    }
}

impl CmdChecker for InboundDataCmdChecker {
    fn check_msg(&mut self, msg: &UnparsedRelayMsg) -> Result<StreamStatus> {
        use tor_cell::relaycell::RelayCmd as C;
        match msg.cmd() {
            C::CONNECTED if !self.connected_received => {
                self.connected_received = true;
                Ok(StreamStatus::Open)
            }
            C::CONNECTED => Err(Error::StreamProto("Received CONNECTED twice".into())),
            C::DATA | C::SENDME if self.connected_received => Ok(StreamStatus::Open),
            C::DATA | C::SENDME => Err(Error::StreamProto(
                "Received data before CONNECTED".into(),
            )),
            C::END => Ok(StreamStatus::Closed),
            other => Err(Error::StreamProto(format!(
                "Unexpected {other} on exit-facing stream"
            ))),
        }
    }

    fn consume_msg(&mut self, _msg: UnparsedRelayMsg) -> Result<()> {
        Ok(())
    }
}

/// A callback that can check whether a given stream request is acceptable
/// immediately on its receipt.
///
/// This should only be used for checks that need to be done immediately, with
/// a view of the state of the circuit; any other checks should be done on the
/// resulting stream once it's been handed off.
pub(crate) trait IncomingStreamRequestFilter: Send + 'static {
    /// Check an incoming stream request, and decide what to do with it.
    fn disposition(
        &mut self,
        ctx: &IncomingStreamRequestContext<'_>,
        circ: &ClientCircSyncView<'_>,
    ) -> Result<IncomingStreamRequestDisposition>;
}

/// What action to take with an incoming stream request.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub(crate) enum IncomingStreamRequestDisposition {
    /// Accept the request (for now), and hand it off to whoever is
    /// collecting incoming streams.
    Accept,
    /// Reject the request, and close the circuit on which it was received.
    CloseCircuit,
    /// Reject the request, and send an END message.
    RejectRequest(tor_cell::relaycell::msg::End),
}

/// Information about a stream request, as passed to an
/// [`IncomingStreamRequestFilter`].
pub(crate) struct IncomingStreamRequestContext<'a> {
    /// The request message itself.
    pub(crate) request: &'a IncomingStreamRequest,
}

impl<'a> IncomingStreamRequestContext<'a> {
    /// Return a reference to the message used to request this stream.
    pub(crate) fn request(&self) -> &'a IncomingStreamRequest {
        self.request
    }
}

/// Information about an incoming stream request, queued up for whoever is
/// accepting them on this circuit.
#[derive(Debug)]
pub(crate) struct StreamReqInfo {
    /// The request itself.
    pub(crate) req: IncomingStreamRequest,
    /// The ID of the stream being requested.
    pub(crate) stream_id: StreamId,
    /// The hop the request arrived from.
    ///
    /// `None` means the only hop that could have sent it (used by relays,
    /// which only ever accept one hop's worth of incoming requests).
    pub(crate) hop_num: Option<HopNum>,
    /// A channel for receiving messages from this stream once accepted.
    pub(crate) receiver: StreamMpscReceiver<UnparsedRelayMsg>,
    /// A channel for sending messages to be sent on this stream once accepted.
    pub(crate) msg_tx: StreamMpscSender<tor_cell::relaycell::msg::AnyRelayMsg>,
    /// The memory quota account to use for this stream.
    pub(crate) memquota: StreamAccount,
}

/// MPSC queue carrying [`StreamReqInfo`] to whoever is accepting incoming
/// stream requests on a circuit.
pub(crate) type StreamReqSender = mq_queue::Sender<StreamReqInfo, mq_queue::MpscSpec>;

/// Data needed for handling incoming stream requests on one hop of a circuit.
pub(crate) struct IncomingStreamRequestHandler {
    /// A sender for sharing information about an incoming stream request.
    pub(crate) incoming_sender: StreamReqSender,
    /// A [`AnyCmdChecker`] for validating incoming stream requests.
    pub(crate) cmd_checker: AnyCmdChecker,
    /// The hop to expect incoming stream requests from.
    ///
    /// `None` if we are a relay accepting requests regardless of which hop
    /// (there is only ever one, for a relay).
    pub(crate) hop_num: Option<HopNum>,
    /// A filter used to check requests before passing them on.
    pub(crate) filter: Box<dyn IncomingStreamRequestFilter>,
}
