//! Notification types used to drive XON/XOFF drain-rate updates.
//!
//! The consumer-facing `AsyncRead` wrapper that watches for buffer drain and
//! reports a new rate back to the circuit reactor lives with the rest of the
//! stream-object API, outside this crate.

/// A marker type for a [`NotifySender`](crate::util::notify::NotifySender)
/// indicating that notifications are for new drain rate requests.
#[derive(Debug)]
pub(crate) struct DrainRateRequest;
