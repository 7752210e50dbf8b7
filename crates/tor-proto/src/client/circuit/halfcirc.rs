//! Tracking for circuits that we've sent a DESTROY cell on, but not yet
//! forgotten entirely.
//!
//! After a channel sends or receives a DESTROY for a circuit, the circuit-id
//! cannot be reused right away: cells already in flight from the other
//! direction may still arrive for a little while. We keep a lightweight
//! [`HalfCirc`] entry around to absorb a bounded number of these without
//! logging a warning for every one of them, while still detecting a peer
//! that keeps sending cells long after the DESTROY.

use crate::{Error, Result};

/// State to track a circuit that is only "half-open": a DESTROY cell has
/// been sent or received on it, but it has not yet been forgotten.
///
/// We allow a small, fixed number of additional cells to arrive on a
/// half-closed circuit before we treat further traffic as a channel-level
/// protocol violation. This bounds the cost of lingering traffic without
/// making every late cell after a DESTROY fatal.
#[derive(Debug)]
pub(crate) struct HalfCirc {
    /// Number of cells that we are still willing to receive on this circuit
    /// before we give up on it and report a protocol violation.
    remaining: u32,
}

impl HalfCirc {
    /// Create a new `HalfCirc`, allowing up to `n` more cells before the
    /// circuit is considered abusive.
    pub(crate) fn new(n: u32) -> Self {
        HalfCirc { remaining: n }
    }

    /// Called when a cell arrives on a circuit-id that is in the
    /// half-closed state.
    ///
    /// Returns an error once the allowance of cells for this circuit is
    /// exhausted.
    pub(crate) fn receive_cell(&mut self) -> Result<()> {
        match self.remaining.checked_sub(1) {
            Some(remaining) => {
                self.remaining = remaining;
                Ok(())
            }
            None => Err(Error::ChanProto(
                "Too many cells received on destroyed circuit".into(),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn allows_bounded_cells() {
        let mut hc = HalfCirc::new(3);
        assert!(hc.receive_cell().is_ok());
        assert!(hc.receive_cell().is_ok());
        assert!(hc.receive_cell().is_ok());
        assert!(hc.receive_cell().is_err());
    }

    #[test]
    fn zero_allowance_rejects_immediately() {
        let mut hc = HalfCirc::new(0);
        assert!(hc.receive_cell().is_err());
    }
}
