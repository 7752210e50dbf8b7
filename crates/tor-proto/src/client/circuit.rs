//! Client-role (origin) specific circuit support.
//!
//! The cell-level pipeline in [`crate::circuit`] is shared between the
//! origin and relay roles; this module holds the pieces that only make
//! sense for an origin circuit: traffic padding and half-circuit tracking
//! on the channel a circuit is built over, and the timeout estimator used
//! to size circuit-build timeouts.

pub(crate) mod halfcirc;
pub(crate) mod padding;

/// Re-exported so that code written against `client::circuit::CircParameters`
/// (the name used before the origin/relay cell pipeline was unified) keeps
/// working without duplicating the type.
pub(crate) use crate::circuit::CircParameters;

use std::time::Duration;

/// A way to estimate how long a circuit build should be allowed to take
/// before we give up on it.
///
/// Implementations live outside this crate (guard/circuit-manager logic is
/// an external collaborator, per spec §1); this crate only needs the trait
/// so that [`crate::pathbias`] can record build timeouts against the
/// estimate that was in effect when the circuit was launched.
pub(crate) trait TimeoutEstimator {
    /// Return the amount of time we should wait for a circuit of the given
    /// `length` (in hops) to finish building.
    fn circuit_build_timeout(&self, length: usize) -> Duration;
}
