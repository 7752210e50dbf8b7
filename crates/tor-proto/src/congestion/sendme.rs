//! SENDME cell windows and circuit-tag validation.
//!
//! Both the fixed-window algorithm and stream-level flow control are built on
//! top of a simple send/receive window pair: every DATA cell consumes one
//! unit, and a SENDME from the other end restores [`WindowParams::increment`]
//! units. On top of that, circuit-level SENDMEs also carry an authentication
//! tag (a cell digest) that must be echoed back to prove the other party has
//! actually processed the cells it claims to have received; [`SendmeValidator`]
//! tracks the tags we expect to see.

use std::collections::VecDeque;
use std::marker::PhantomData;

use subtle::ConstantTimeEq;
use tor_cell::relaycell::{RelayCmd, UnparsedRelayMsg};

use crate::{Error, Result};

/// Constant parameters describing a window's starting size and increment.
pub(crate) trait WindowParams {
    /// The value a window starts at when a circuit or stream is opened.
    fn start() -> u16;
    /// How much a single SENDME adds back to the window.
    fn increment() -> u16;
}

/// Window parameters for circuit-level (legacy, fixed-window) flow control.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CircParams;

impl WindowParams for CircParams {
    fn start() -> u16 {
        1000
    }
    fn increment() -> u16 {
        100
    }
}

/// Window parameters for stream-level flow control.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamParams;

impl WindowParams for StreamParams {
    fn start() -> u16 {
        500
    }
    fn increment() -> u16 {
        50
    }
}

/// A window tracking how many more DATA cells we are allowed to send.
///
/// The window is decremented by one for every DATA cell sent, and restored
/// by `P::increment()` every time we receive a SENDME.
#[derive(Clone, Debug)]
pub(crate) struct SendWindow<P> {
    /// Cells we are still allowed to send before we must wait for a SENDME.
    window: u16,
    /// Which kind of window this is (circuit- or stream-level).
    _params: PhantomData<P>,
}

impl<P: WindowParams> SendWindow<P> {
    /// Create a new send window starting at `window`.
    pub(crate) fn new(window: u16) -> Self {
        Self {
            window,
            _params: PhantomData,
        }
    }

    /// Return the number of cells we can still send.
    pub(crate) fn window(&self) -> u16 {
        self.window
    }

    /// Consume one unit of window, to be called whenever we send a DATA cell.
    pub(crate) fn take(&mut self) -> Result<()> {
        self.window = self
            .window
            .checked_sub(1)
            .ok_or_else(|| Error::CircProto("tried to send past the end of the window".into()))?;
        Ok(())
    }

    /// Restore `P::increment()` units, to be called on receipt of a SENDME.
    pub(crate) fn put(&mut self) -> Result<()> {
        self.window = self.window.saturating_add(P::increment());
        Ok(())
    }

    /// Return true if the cell we are about to send is the one whose digest
    /// the other party will be asked to echo back in its next SENDME.
    pub(crate) fn should_record_tag(&self) -> bool {
        self.window % P::increment() == 0
    }
}

/// A send window for a circuit (legacy, fixed-window congestion control).
pub(crate) type CircSendWindow = SendWindow<CircParams>;
/// A send window for a stream.
pub(crate) type StreamSendWindow = SendWindow<StreamParams>;

/// A window tracking how many more DATA cells we are willing to accept
/// before we owe the other party a SENDME.
#[derive(Clone, Debug)]
pub(crate) struct RecvWindow<P> {
    /// Cells we can still accept before we must send a SENDME.
    window: u16,
    /// Which kind of window this is (circuit- or stream-level).
    _params: PhantomData<P>,
}

impl<P: WindowParams> RecvWindow<P> {
    /// Create a new receive window starting at `window`.
    pub(crate) fn new(window: u16) -> Self {
        Self {
            window,
            _params: PhantomData,
        }
    }

    /// Consume one unit of window, to be called whenever we accept a DATA
    /// cell. Returns true if a SENDME is now owed to the sender.
    pub(crate) fn take(&mut self) -> Result<bool> {
        self.window = self
            .window
            .checked_sub(1)
            .ok_or_else(|| Error::CircProto("received data past the end of the window".into()))?;
        Ok(self.window % P::increment() == 0)
    }

    /// Restore `P::increment()` units, to be called after sending a SENDME.
    pub(crate) fn put(&mut self) {
        self.window = self.window.saturating_add(P::increment());
    }
}

/// A receive window for a circuit.
pub(crate) type CircRecvWindow = RecvWindow<CircParams>;
/// A receive window for a stream.
pub(crate) type StreamRecvWindow = RecvWindow<StreamParams>;

/// An authenticated circuit-level SENDME tag.
///
/// Legacy (Tor1) circuits authenticate a SENDME with a 20-byte digest;
/// CGO circuits use a 16-byte tag taken directly from the wide-block cipher.
/// Shorter tags are zero-padded so every tag in a [`SendmeValidator`]'s queue
/// has the same width and can be compared in constant time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CircTag([u8; 20]);

impl CircTag {
    /// Build a tag from a variable-length digest, zero-padding it to 20 bytes.
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut tag = [0_u8; 20];
        let n = bytes.len().min(tag.len());
        tag[..n].copy_from_slice(&bytes[..n]);
        CircTag(tag)
    }
}

impl From<[u8; 20]> for CircTag {
    fn from(tag: [u8; 20]) -> Self {
        CircTag(tag)
    }
}

impl From<[u8; 16]> for CircTag {
    fn from(tag: [u8; 16]) -> Self {
        CircTag::from_bytes(&tag)
    }
}

impl ConstantTimeEq for CircTag {
    fn ct_eq(&self, other: &Self) -> subtle::Choice {
        self.0.ct_eq(&other.0)
    }
}

/// Tracks the circuit tags we expect to see echoed back to us, in the order
/// we recorded them.
///
/// Congestion control algorithms may record more than one tag before a
/// SENDME shows up in reply (for example during slow start), so this is a
/// small FIFO queue rather than a single pending tag.
#[derive(Debug)]
pub(crate) struct SendmeValidator<T> {
    /// Tags recorded on outgoing DATA cells, oldest first.
    tags: VecDeque<T>,
}

impl<T: Clone + ConstantTimeEq> SendmeValidator<T> {
    /// Create a validator with no pending tags.
    pub(crate) fn new() -> Self {
        Self {
            tags: VecDeque::new(),
        }
    }

    /// Record the digest of an outgoing DATA cell that a future SENDME will
    /// need to acknowledge.
    pub(crate) fn record<U: Clone + Into<T>>(&mut self, tag: &U) {
        self.tags.push_back(tag.clone().into());
    }

    /// Validate an incoming SENDME.
    ///
    /// If `tag` is `Some`, it must match the oldest recorded tag exactly
    /// (an authenticated SENDME). If `tag` is `None`, the oldest recorded
    /// tag is simply consumed (an unauthenticated, legacy SENDME).
    ///
    /// Returns an error (which should close the circuit) if there was no
    /// tag pending, or if the tag doesn't match.
    pub(crate) fn validate(&mut self, tag: Option<T>) -> Result<()> {
        let expected = self
            .tags
            .pop_front()
            .ok_or_else(|| Error::CircProto("unexpected SENDME cell".into()))?;
        match tag {
            None => Ok(()),
            Some(tag) => {
                if bool::from(tag.ct_eq(&expected)) {
                    Ok(())
                } else {
                    Err(Error::CircProto(
                        "mismatched SENDME authentication tag".into(),
                    ))
                }
            }
        }
    }

    /// For testing: the tags currently pending, oldest first.
    #[cfg(test)]
    pub(crate) fn expected_tags(&self) -> Vec<T> {
        self.tags.iter().cloned().collect()
    }
}

/// Return true if `cmd` is a relay command that counts against sendme
/// windows (consuming one unit when sent, or owing a SENDME when received).
///
/// Only DATA cells are windowed; control cells such as SENDME, CONNECTED,
/// END and the rest flow freely.
pub(crate) fn cmd_counts_towards_windows(cmd: RelayCmd) -> bool {
    cmd == RelayCmd::DATA
}

/// As [`cmd_counts_towards_windows`], but takes a whole unparsed relay
/// message.
pub(crate) fn cell_counts_towards_windows(msg: &UnparsedRelayMsg) -> bool {
    cmd_counts_towards_windows(msg.cmd())
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn windows_count_down_and_refill() {
        let mut send = CircSendWindow::new(CircParams::start());
        for _ in 0..CircParams::increment() {
            send.take().unwrap();
        }
        assert_eq!(send.window(), CircParams::start() - CircParams::increment());
        send.put().unwrap();
        assert_eq!(send.window(), CircParams::start());
    }

    #[test]
    fn send_window_underflows_to_error() {
        let mut send = StreamSendWindow::new(0);
        assert!(send.take().is_err());
    }

    #[test]
    fn recv_window_reports_when_sendme_is_owed() {
        let mut recv = StreamRecvWindow::new(StreamParams::start());
        let mut owed = false;
        for _ in 0..StreamParams::increment() {
            owed = recv.take().unwrap();
        }
        assert!(owed);
    }

    #[test]
    fn validator_accepts_matching_tags_in_order() {
        let mut v: SendmeValidator<CircTag> = SendmeValidator::new();
        let t1 = CircTag::from([1_u8; 20]);
        let t2 = CircTag::from([2_u8; 20]);
        v.record(&t1);
        v.record(&t2);
        v.validate(Some(t1)).unwrap();
        v.validate(Some(t2)).unwrap();
    }

    #[test]
    fn validator_rejects_wrong_tag() {
        let mut v: SendmeValidator<CircTag> = SendmeValidator::new();
        v.record(&CircTag::from([1_u8; 20]));
        assert!(v.validate(Some(CircTag::from([9_u8; 20]))).is_err());
    }

    #[test]
    fn validator_rejects_unexpected_sendme() {
        let mut v: SendmeValidator<CircTag> = SendmeValidator::new();
        assert!(v.validate(None).is_err());
    }

    #[test]
    fn short_tags_are_zero_padded() {
        let from16 = CircTag::from([7_u8; 16]);
        let mut expected = [0_u8; 20];
        expected[..16].copy_from_slice(&[7_u8; 16]);
        assert_eq!(from16, CircTag::from(expected));
    }
}
