//! Relay-side helpers for handling inbound `CREATE*` cells and building the
//! matching `CREATED*`/`DESTROY` reply.
//!
//! This is the mirror image of the origin-side `CreateHandshakeWrap` family
//! (an origin sends a `CREATE*` and decodes the `CREATED*`/`DESTROY` that
//! comes back via [`crate::circuit::celltypes::CreateResponse`]): this
//! module lets a relay decode an inbound `CREATE*` and encode its own
//! reply. The two halves share nothing but the wire types in
//! `tor_cell::chancell::msg`, since the relay never originates a `CREATE*`
//! and the client-role code never answers one.

use tor_cell::chancell::msg::{
    AnyChanMsg, Create, Create2, CreateFast, Created, Created2, CreatedFast, HandshakeType,
};

use crate::relay::dispatch::CreateRejection;
use crate::{Error, Result};

/// A `CREATE*` cell's handshake request, already narrowed from
/// [`AnyChanMsg`] to the three variants [`crate::relay::dispatch::classify`]
/// recognizes as [`crate::relay::dispatch::CommandClass::Create`].
#[derive(Clone, Debug)]
pub(crate) enum CreateRequest {
    /// Legacy TAP handshake (`CREATE`). Always refused: see
    /// [`CreateRejection::UnsupportedOnionskin`].
    Tap(Create),
    /// `CREATE_FAST`: no public-key crypto, usable only on an already
    /// secure channel.
    Fast(CreateFast),
    /// `CREATE2`: a typed handshake, almost always ntor or ntor-v3 in
    /// current deployments.
    V2(Create2),
}

impl TryFrom<AnyChanMsg> for CreateRequest {
    type Error = Error;

    fn try_from(m: AnyChanMsg) -> Result<CreateRequest> {
        match m {
            AnyChanMsg::Create(m) => Ok(CreateRequest::Tap(m)),
            AnyChanMsg::CreateFast(m) => Ok(CreateRequest::Fast(m)),
            AnyChanMsg::Create2(m) => Ok(CreateRequest::V2(m)),
            _ => Err(Error::ChanProto(format!(
                "Expected a CREATE cell, got {}",
                m.cmd()
            ))),
        }
    }
}

impl CreateRequest {
    /// The handshake type named in this request, for the purposes of
    /// [`CreateRejection::UnsupportedOnionskin`] and dispatch to an
    /// onionskin responder.
    ///
    /// `CREATE_FAST` has no explicit type field on the wire; it is modelled
    /// here as its own [`HandshakeType`] so callers can treat all three
    /// request kinds uniformly.
    pub(crate) fn handshake_type(&self) -> HandshakeType {
        match self {
            CreateRequest::Tap(_) => HandshakeType::TAP,
            CreateRequest::Fast(_) => HandshakeType::from(u16::MAX),
            CreateRequest::V2(m) => m.handshake_type(),
        }
    }

    /// The raw handshake bytes carried by this cell.
    pub(crate) fn handshake_body(&self) -> &[u8] {
        match self {
            CreateRequest::Tap(_) => &[],
            CreateRequest::Fast(m) => m.handshake(),
            CreateRequest::V2(m) => m.body(),
        }
    }
}

/// An object that can wrap a completed handshake reply into the `CREATED*`
/// cell matching the `CREATE*` cell that started it, or manufacture the
/// `DESTROY` to send if the handshake failed.
///
/// Chosen per [`CreateRequest`] via [`reply_wrap_for`].
pub(crate) trait CreateReplyWrap {
    /// Wrap `bytes` (the onionskin responder's output) into the appropriate
    /// `CREATED*` cell.
    fn to_chanmsg(&self, bytes: Vec<u8>) -> AnyChanMsg;
}

/// Replies to a `CREATE_FAST` with `CREATED_FAST`.
pub(crate) struct CreatedFastWrap;

impl CreateReplyWrap for CreatedFastWrap {
    fn to_chanmsg(&self, bytes: Vec<u8>) -> AnyChanMsg {
        CreatedFast::new(bytes).into()
    }
}

/// Replies to a `CREATE2` with `CREATED2`.
pub(crate) struct Created2Wrap;

impl CreateReplyWrap for Created2Wrap {
    fn to_chanmsg(&self, bytes: Vec<u8>) -> AnyChanMsg {
        Created2::new(bytes).into()
    }
}

/// Replies to the legacy `CREATE` with `CREATED`.
///
/// Kept only so [`reply_wrap_for`] is total; in practice
/// [`CreateRejection::UnsupportedOnionskin`] means this reply is never sent
/// (see §4.6, and [`crate::relay::dispatch::validate_create`]).
pub(crate) struct CreatedTapWrap;

impl CreateReplyWrap for CreatedTapWrap {
    fn to_chanmsg(&self, bytes: Vec<u8>) -> AnyChanMsg {
        Created::new(bytes).into()
    }
}

/// Pick the [`CreateReplyWrap`] matching `req`'s cell type.
pub(crate) fn reply_wrap_for(req: &CreateRequest) -> Box<dyn CreateReplyWrap + Send> {
    match req {
        CreateRequest::Tap(_) => Box::new(CreatedTapWrap),
        CreateRequest::Fast(_) => Box::new(CreatedFastWrap),
        CreateRequest::V2(_) => Box::new(Created2Wrap),
    }
}

/// Whether `req`'s handshake type is one this relay still answers.
///
/// Matches the `onionskin_supported` field consumed by
/// [`crate::relay::dispatch::validate_create`]: only `CREATE_FAST` and
/// `CREATE2` with a non-TAP type are accepted.
pub(crate) fn onionskin_supported(req: &CreateRequest) -> bool {
    !matches!(req, CreateRequest::Tap(_))
}

/// Map a refused [`CreateRequest`] straight to the rejection reason, for
/// callers that already know the only possible cause is the onionskin type.
pub(crate) fn unsupported_reason(req: &CreateRequest) -> Option<CreateRejection> {
    if onionskin_supported(req) {
        None
    } else {
        Some(CreateRejection::UnsupportedOnionskin)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn tap_create_is_unsupported() {
        let req = CreateRequest::Tap(Create::new(vec![0_u8; 186]));
        assert!(!onionskin_supported(&req));
        assert_eq!(
            unsupported_reason(&req),
            Some(CreateRejection::UnsupportedOnionskin)
        );
    }

    #[test]
    fn create2_roundtrips_handshake_type() {
        let req = CreateRequest::V2(Create2::new(HandshakeType::NTOR_V3, vec![1, 2, 3]));
        assert_eq!(req.handshake_type(), HandshakeType::NTOR_V3);
        assert_eq!(req.handshake_body(), &[1, 2, 3]);
        assert!(onionskin_supported(&req));
        assert!(unsupported_reason(&req).is_none());
    }

    #[test]
    fn create_fast_round_trips_body() {
        let req = CreateRequest::Fast(CreateFast::new(vec![9; 20]));
        assert_eq!(req.handshake_body(), &[9; 20]);
        assert!(onionskin_supported(&req));
    }

    #[test]
    fn reply_wrap_matches_request_kind() {
        let req = CreateRequest::V2(Create2::new(HandshakeType::NTOR, vec![]));
        let wrap = reply_wrap_for(&req);
        match wrap.to_chanmsg(vec![1, 2, 3]) {
            AnyChanMsg::Created2(_) => {}
            other => panic!("expected Created2, got {other:?}"),
        }
    }
}
