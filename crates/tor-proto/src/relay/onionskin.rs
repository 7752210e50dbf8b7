//! Boundary trait for answering a relay's `CREATE*`/`EXTEND*` handshakes.
//!
//! §5's concurrency model puts onionskin processing (the CPU-bound
//! server-side half of the ntor/ntor-v3/`CREATE_FAST` handshakes) in a
//! worker pool outside the single-threaded per-circuit reactors, so that a
//! burst of new circuits never blocks cell relaying that is already in
//! progress. [`OnionskinResponder`] is the seam between the channel
//! reactor's [`super::dispatch`]/[`super::create`] cell handling and that
//! pool: the reactor builds a [`CreateTask`] from the validated `CREATE*`
//! cell and hands it to a responder, which does the actual (stateful,
//! key-material-touching) handshake work off this crate's critical path
//! and returns a [`CreateOutcome`].
//!
//! This crate intentionally stops at the trait. A concrete responder needs
//! the relay's long-term onion key material and the rest of the ntor/ntor-v3
//! handshake state machine, which live in `tor-relay-crypto` (see
//! `DESIGN.md`); nothing in the corpus this crate was grounded on implements
//! that crate's `src/`, so providing a fake implementation here would be
//! inventing cryptography rather than learning it. Tests in this module use
//! a trivial in-memory fake that only exercises the trait's plumbing.

use async_trait::async_trait;

use tor_cell::chancell::msg::HandshakeType;

use crate::Result;
use crate::crypto::cell::{InboundRelayLayer, OutboundRelayLayer};

/// Everything an [`OnionskinResponder`] needs to answer one `CREATE*` cell.
#[derive(Clone, Debug)]
pub(crate) struct CreateTask {
    /// The handshake type named in the `CREATE*`/`CREATE2` cell.
    pub(crate) handshake_type: HandshakeType,
    /// The raw handshake bytes from the cell.
    pub(crate) handshake_body: Vec<u8>,
}

/// A completed handshake: the bytes to echo back in `CREATED*`, plus the
/// per-direction relay crypto layers derived from it.
///
/// The layers are exactly what [`crate::crypto::cell`] uses to en/decrypt
/// `RELAY` cell bodies at this hop (see C2 in `DESIGN.md`); a successful
/// [`OnionskinResponder`] call is what seeds them for a freshly created
/// circuit.
pub(crate) struct CreateOutcome {
    /// Bytes to send back in the `CREATED*`/`CREATED2` cell.
    pub(crate) reply_body: Vec<u8>,
    /// Encrypts cells travelling from this relay back towards the client.
    pub(crate) inbound_layer: Box<dyn InboundRelayLayer + Send>,
    /// Decrypts cells arriving from the client at this relay.
    pub(crate) outbound_layer: Box<dyn OutboundRelayLayer + Send>,
}

/// An object that can perform the server side of a circuit-creation
/// handshake.
///
/// Implementations are expected to run the actual handshake computation on
/// a worker pool or blocking-task executor, per §5; nothing in this trait
/// requires that, but a caller that awaits `answer_create` directly on the
/// channel reactor's own task would defeat the purpose of this seam.
#[async_trait]
pub(crate) trait OnionskinResponder {
    /// Answer a `CREATE*` handshake.
    ///
    /// Returns `Err` if the handshake is malformed or cryptographically
    /// invalid; the caller replies with `DESTROY` in that case (§4.6/§7)
    /// rather than closing the channel.
    async fn answer_create(&self, task: CreateTask) -> Result<CreateOutcome>;
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// A fake responder used only to exercise the trait's plumbing; it does
    /// no real cryptography and must never be used outside tests.
    struct EchoResponder;

    #[async_trait]
    impl OnionskinResponder for EchoResponder {
        async fn answer_create(&self, task: CreateTask) -> Result<CreateOutcome> {
            use crate::crypto::cell::RelayCellBody;
            use tor_cell::chancell::ChanCmd;
            use tor_cell::relaycell::msg::SendmeTag;

            struct NullInbound;
            impl InboundRelayLayer for NullInbound {
                fn originate(&mut self, _cmd: ChanCmd, _cell: &mut RelayCellBody) -> SendmeTag {
                    SendmeTag::from([0_u8; 20])
                }
                fn encrypt_inbound(&mut self, _cmd: ChanCmd, _cell: &mut RelayCellBody) {}
            }
            struct NullOutbound;
            impl OutboundRelayLayer for NullOutbound {
                fn decrypt_outbound(
                    &mut self,
                    _cmd: ChanCmd,
                    _cell: &mut RelayCellBody,
                ) -> Option<SendmeTag> {
                    None
                }
            }

            Ok(CreateOutcome {
                reply_body: task.handshake_body,
                inbound_layer: Box::new(NullInbound),
                outbound_layer: Box::new(NullOutbound),
            })
        }
    }

    #[test]
    fn echo_responder_round_trips_body() {
        tor_rtcompat::test_with_one_runtime!(|_rt| async move {
            let responder = EchoResponder;
            let task = CreateTask {
                handshake_type: HandshakeType::NTOR_V3,
                handshake_body: vec![1, 2, 3, 4],
            };
            let outcome = responder.answer_create(task).await.unwrap();
            assert_eq!(outcome.reply_body, vec![1, 2, 3, 4]);
        });
    }
}
