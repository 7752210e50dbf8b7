//! Stream-level support shared by the client and relay roles.
//!
//! A stream is an anonymized conversation; multiple streams can be
//! multiplexed over a single circuit. The relay role never reads or writes a
//! stream's payload itself (it forwards `RELAY` cells between hops), but it
//! shares the command-checking and incoming-stream-request machinery in this
//! module with the client role, which is why both live here rather than
//! under `client`.
//!
//! Origin-side stream handles (`DataStream`, `ResolveStream`, ...) are a
//! client-only concern and are out of scope for this crate's relay-core
//! focus; see `DESIGN.md`.

mod cmdcheck;
mod flow_control;
#[cfg(any(feature = "hs-service", feature = "relay"))]
mod incoming;
mod params;

pub(crate) use cmdcheck::{AnyCmdChecker, CmdChecker, StreamStatus};
#[cfg(any(feature = "hs-service", feature = "relay"))]
pub(crate) use incoming::{
    IncomingStreamRequest, IncomingStreamRequestContext, IncomingStreamRequestDisposition,
    IncomingStreamRequestFilter, IncomingStreamRequestHandler, InboundDataCmdChecker,
    StreamReqInfo, StreamReqSender,
};
pub use params::StreamParameters;

pub use tor_cell::relaycell::msg::IpVersionPreference;

pub(crate) use flow_control::StreamSendFlowControl;

use tor_cell::relaycell::msg::End;

/// A behavior to perform when closing a stream.
///
/// We don't use `Option<End>` here, since the behavior of `SendNothing` is so
/// surprising that we shouldn't let it pass unremarked.
#[derive(Clone, Debug)]
pub(crate) enum CloseStreamBehavior {
    /// Send nothing at all, so that the other side will not realize we have
    /// closed the stream.
    ///
    /// Only used for incoming onion service / relay-exit streams when we
    /// want to black-hole the other side's requests.
    SendNothing,
    /// Send an End cell, if we haven't already sent one.
    SendEnd(End),
}

impl Default for CloseStreamBehavior {
    fn default() -> Self {
        Self::SendEnd(End::new_misc())
    }
}
