//! Per-guard path-bias tracking.
//!
//! A guard that builds circuits but silently fails to carry traffic over
//! them is indistinguishable, from the client's point of view, from one that
//! is merely unlucky -- unless we keep score. This module counts circuit
//! build/use attempts and successes per guard, periodically scales the
//! counters down so old behavior doesn't drown out recent behavior, and
//! issues a "probe" stream (a `BEGIN` to a bogus exit-policy-rejected
//! address) on circuits that never carried a successful stream, so a guard
//! that drops streams can be told apart from a guard attached to a dead
//! circuit.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use tor_cell::relaycell::StreamId;
use tor_units::Percentage;
use tracing::{debug, warn};

/// Consensus-derived thresholds and scaling factors for path-bias tracking.
///
/// Field names mirror the consensus parameter names (`pb_mincircs`,
/// `pb_noticepct`, and so on) so that a caller wiring this up from a live
/// consensus can do so field-by-field.
#[derive(Clone, Debug)]
pub struct PathBiasParams {
    /// Minimum number of circuits built through a guard before its build
    /// success rate is evaluated at all.
    pub min_circs: u32,
    /// Build-success rate below which we log a notice.
    pub notice_pct: Percentage<u32>,
    /// Build-success rate below which we log a warning.
    pub warn_pct: Percentage<u32>,
    /// Build-success rate below which, combined with `drop_guards`, we
    /// disable the guard.
    pub extreme_pct: Percentage<u32>,
    /// Number of attempts after which build counters are scaled down.
    pub scale_circs: u32,
    /// Factor the build counters are scaled by once `scale_circs` is
    /// exceeded.
    pub scale_factor: Percentage<u32>,
    /// Minimum number of used circuits before the use-success rate is
    /// evaluated.
    pub min_use: u32,
    /// Use-success rate below which we log a notice.
    pub notice_use_pct: Percentage<u32>,
    /// Use-success rate below which, combined with `drop_guards`, we
    /// disable the guard.
    pub extreme_use_pct: Percentage<u32>,
    /// Number of use-attempts after which use counters are scaled down.
    pub scale_use: u32,
    /// Whether a guard that crosses the extreme threshold is actually
    /// disabled, or merely logged about.
    pub drop_guards: bool,
}

/// Per-guard path-bias counters.
///
/// All counters are monotonically increasing between scale-down events;
/// [`PathBiasState::maybe_scale`] divides every counter by `scale_factor`
/// once enough circuits have accumulated, so the state reflects recent
/// history rather than the guard's entire lifetime.
#[derive(Clone, Debug, Default)]
pub struct PathBiasState {
    /// Number of circuits we attempted to build through this guard.
    attempts: u32,
    /// Number of those circuits that completed their build handshake.
    successes: u32,
    /// Number of circuits we attempted to use (sent application data over).
    use_attempts: u32,
    /// Number of those circuits on which at least one stream succeeded.
    use_successes: u32,
    /// Circuits that collapsed (were torn down) before any use.
    collapses: u32,
    /// Circuits that became unusable (e.g. the first stream failed and the
    /// probe also failed) before any use.
    unusable: u32,
    /// Circuits whose build handshake timed out.
    timeouts: u32,
    /// Whether this guard has already been logged about at the current
    /// severity, to avoid repeating the same warning every circuit.
    warned: bool,
    /// Whether this guard has been disabled due to extreme failure rates.
    disabled: bool,
}

impl PathBiasState {
    /// Create a fresh, all-zero state for a newly added guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt to build a circuit through this guard.
    pub fn note_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Record that a circuit's build handshake completed successfully.
    pub fn note_build_success(&mut self) {
        self.successes = self.successes.saturating_add(1);
    }

    /// Record that a circuit's build handshake timed out.
    pub fn note_build_timeout(&mut self) {
        self.timeouts = self.timeouts.saturating_add(1);
    }

    /// Record that a built circuit collapsed before any stream was
    /// attempted on it.
    pub fn note_collapse(&mut self) {
        self.collapses = self.collapses.saturating_add(1);
    }

    /// Record an attempt to use a built circuit (send application data).
    pub fn note_use_attempt(&mut self) {
        self.use_attempts = self.use_attempts.saturating_add(1);
    }

    /// Record that at least one stream on a used circuit succeeded.
    pub fn note_use_success(&mut self) {
        self.use_successes = self.use_successes.saturating_add(1);
    }

    /// Record that a circuit was marked unusable: its first stream failed,
    /// and a validation probe either failed or was never answered.
    pub fn note_unusable(&mut self) {
        self.unusable = self.unusable.saturating_add(1);
    }

    /// True if this guard has been disabled due to extreme path-bias
    /// failure rates.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Build-success rate as a percentage of attempts, or `None` if there
    /// have been no attempts yet.
    fn build_success_pct(&self) -> Option<u32> {
        (self.attempts > 0).then(|| (self.successes * 100) / self.attempts)
    }

    /// Use-success rate as a percentage of use-attempts, or `None` if there
    /// have been no use-attempts yet.
    fn use_success_pct(&self) -> Option<u32> {
        (self.use_attempts > 0).then(|| (self.use_successes * 100) / self.use_attempts)
    }

    /// Scale every counter down by `params.scale_factor` once the relevant
    /// attempt counter crosses its scale threshold.
    ///
    /// This keeps the tracked window bounded to recent behavior instead of
    /// accumulating indefinitely over a guard's whole lifetime.
    pub fn maybe_scale(&mut self, params: &PathBiasParams) {
        if self.attempts > params.scale_circs {
            let factor = params.scale_factor.as_percent();
            self.attempts = (self.attempts * factor) / 100;
            self.successes = (self.successes * factor) / 100;
            self.collapses = (self.collapses * factor) / 100;
            self.timeouts = (self.timeouts * factor) / 100;
        }
        if self.use_attempts > params.scale_use {
            let factor = params.scale_factor.as_percent();
            self.use_attempts = (self.use_attempts * factor) / 100;
            self.use_successes = (self.use_successes * factor) / 100;
            self.unusable = (self.unusable * factor) / 100;
        }
    }

    /// Evaluate current success rates against the configured thresholds,
    /// logging and (if so configured) disabling the guard when warranted.
    ///
    /// Call this after each circuit outcome is recorded.
    pub fn check_thresholds(&mut self, guard: &str, params: &PathBiasParams) {
        if self.disabled {
            return;
        }
        if let Some(pct) = self.build_success_pct() {
            if self.attempts >= params.min_circs {
                self.report(
                    guard,
                    "build",
                    pct,
                    params.extreme_pct.as_percent(),
                    params.warn_pct.as_percent(),
                    params.notice_pct.as_percent(),
                    params.drop_guards,
                );
            }
        }
        if let Some(pct) = self.use_success_pct() {
            if self.use_attempts >= params.min_use {
                self.report(
                    guard,
                    "use",
                    pct,
                    params.extreme_use_pct.as_percent(),
                    params.extreme_use_pct.as_percent(),
                    params.notice_use_pct.as_percent(),
                    params.drop_guards,
                );
            }
        }
    }

    /// Shared logging/disable logic for both the build-rate and use-rate
    /// checks.
    #[allow(clippy::too_many_arguments)]
    fn report(
        &mut self,
        guard: &str,
        what: &str,
        pct: u32,
        extreme_pct: u32,
        warn_pct: u32,
        notice_pct: u32,
        drop_guards: bool,
    ) {
        if pct < extreme_pct {
            warn!(guard, what, pct, "path-bias: extreme failure rate");
            if drop_guards {
                self.disabled = true;
                warn!(guard, "path-bias: disabling guard");
            }
            self.warned = true;
        } else if pct < warn_pct {
            warn!(guard, what, pct, "path-bias: high failure rate");
            self.warned = true;
        } else if pct < notice_pct && !self.warned {
            debug!(guard, what, pct, "path-bias: elevated failure rate");
        }
    }
}

/// A bogus destination used to probe a circuit that had a stream fail
/// before any stream succeeded on it.
///
/// The low three bytes of the (unroutable, `0.x.x.x`) address double as a
/// nonce; a well-behaved exit will refuse the connection with
/// `END(EXITPOLICY)` and echo the address back, letting us confirm that the
/// reply actually came from our own probe rather than a stale or spoofed
/// cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathBiasProbe {
    /// The address used as the probe's `BEGIN` target; its low 3 bytes are
    /// the nonce.
    address: Ipv4Addr,
}

impl PathBiasProbe {
    /// Build a new probe with a freshly generated nonce.
    pub fn new() -> Self {
        let mut nonce = [0_u8; 3];
        rand::rng().fill_bytes(&mut nonce);
        Self {
            address: Ipv4Addr::new(0, nonce[0], nonce[1], nonce[2]),
        }
    }

    /// The address to use as the probe's `BEGIN` target, port 25.
    pub fn target(&self) -> (Ipv4Addr, u16) {
        (self.address, 25)
    }

    /// Validate an `END(EXITPOLICY)` reply's echoed address against this
    /// probe's nonce.
    ///
    /// A mismatched or missing echoed address means the reply cannot be
    /// trusted to answer this probe; the caller should treat the circuit as
    /// use-failed either way.
    pub fn validate_reply(&self, echoed: Option<Ipv4Addr>) -> bool {
        echoed == Some(self.address)
    }
}

impl Default for PathBiasProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-circuit path-bias state, attached to one origin circuit for its whole
/// lifetime.
///
/// This is the circuit-lifecycle half of path-bias tracking: it owns the
/// shared per-guard [`PathBiasState`] counters reachable from this circuit,
/// and the bookkeeping needed to turn "first stream failed" into "send a
/// probe and judge the guard by its reply" rather than an immediate guard
/// penalty (§4.7 step 3, §4.12). It is wired into
/// [`crate::circuit::reactor::forward::ForwardReactor::handle_relay_msg`],
/// which calls [`Self::check_probe_reply`] before delivering a stream-level
/// `END` to the stream map.
pub(crate) struct PathBiasCircuitState {
    /// Counters shared with every other circuit built through the same
    /// guard.
    guard: Arc<Mutex<PathBiasState>>,
    /// Whether at least one stream on this circuit has already succeeded.
    ///
    /// Once true, a later stream failure is just an ordinary stream
    /// failure: the circuit has already proven the guard isn't dropping
    /// everything, so no probe is issued.
    used_successfully: bool,
    /// The probe we are currently waiting on a reply for, if any, and the
    /// stream ID it was sent under.
    pending_probe: Option<(StreamId, PathBiasProbe)>,
}

impl PathBiasCircuitState {
    /// Start tracking a freshly built circuit, recording the build attempt
    /// against `guard`.
    pub(crate) fn new(guard: Arc<Mutex<PathBiasState>>) -> Self {
        guard.lock().expect("poisoned lock").note_attempt();
        Self {
            guard,
            used_successfully: false,
            pending_probe: None,
        }
    }

    /// Record that this circuit's build handshake completed.
    pub(crate) fn note_build_success(&self) {
        self.guard.lock().expect("poisoned lock").note_build_success();
    }

    /// Record that a stream on this circuit carried data successfully.
    pub(crate) fn note_stream_success(&mut self) {
        if !self.used_successfully {
            self.used_successfully = true;
            self.guard.lock().expect("poisoned lock").note_use_success();
        }
    }

    /// A stream on this circuit failed before any data arrived, and no
    /// stream on this circuit has succeeded yet: issue a validation probe
    /// instead of directly blaming the guard.
    ///
    /// Returns the probe to send as a `BEGIN` under `sid`. The caller is
    /// responsible for routing the reply to `sid` back through
    /// [`Self::check_probe_reply`] instead of the application.
    pub(crate) fn issue_probe(&mut self, sid: StreamId) -> Option<PathBiasProbe> {
        if self.used_successfully || self.pending_probe.is_some() {
            return None;
        }
        self.guard.lock().expect("poisoned lock").note_use_attempt();
        let probe = PathBiasProbe::new();
        self.pending_probe = Some((sid, probe));
        Some(probe)
    }

    /// The stream ID of our pending probe, if any.
    ///
    /// Lets a caller check whether an incoming message's stream ID is worth
    /// decoding as a probe reply before actually parsing it.
    pub(crate) fn pending_probe_sid(&self) -> Option<StreamId> {
        self.pending_probe.as_ref().map(|(sid, _)| *sid)
    }

    /// If this circuit has a pending probe and `sid` matches it, validate
    /// `echoed` against the probe's nonce, record the outcome, and report
    /// that the message must be dropped rather than delivered to the
    /// stream map.
    ///
    /// Returns `false` (deliver normally) for any message that isn't a
    /// reply to our own pending probe.
    pub(crate) fn check_probe_reply(&mut self, sid: StreamId, echoed: Option<IpAddr>) -> bool {
        let Some((probe_sid, probe)) = self.pending_probe.take() else {
            return false;
        };
        if probe_sid != sid {
            self.pending_probe = Some((probe_sid, probe));
            return false;
        }
        let echoed = echoed.and_then(|a| match a {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        });
        let mut guard = self.guard.lock().expect("poisoned lock");
        if probe.validate_reply(echoed) {
            guard.note_use_success();
        } else {
            guard.note_unusable();
        }
        true
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn test_params() -> PathBiasParams {
        PathBiasParams {
            min_circs: 4,
            notice_pct: Percentage::new(70),
            warn_pct: Percentage::new(50),
            extreme_pct: Percentage::new(30),
            scale_circs: 200,
            scale_factor: Percentage::new(50),
            min_use: 4,
            notice_use_pct: Percentage::new(80),
            extreme_use_pct: Percentage::new(20),
            scale_use: 100,
            drop_guards: true,
        }
    }

    #[test]
    fn counts_accumulate() {
        let mut s = PathBiasState::new();
        for _ in 0..4 {
            s.note_attempt();
            s.note_build_success();
        }
        assert_eq!(s.build_success_pct(), Some(100));
    }

    #[test]
    fn extreme_failure_disables_guard_when_configured() {
        let mut s = PathBiasState::new();
        let params = test_params();
        for _ in 0..10 {
            s.note_attempt();
        }
        s.note_build_success();
        s.check_thresholds("test-guard", &params);
        assert!(s.is_disabled());
    }

    #[test]
    fn scaling_halves_counters_past_threshold() {
        let mut s = PathBiasState::new();
        let params = test_params();
        s.attempts = params.scale_circs + 1;
        s.successes = params.scale_circs;
        s.maybe_scale(&params);
        assert!(s.attempts < params.scale_circs);
    }

    #[test]
    fn probe_validates_matching_echo_only() {
        let probe = PathBiasProbe::new();
        let (addr, port) = probe.target();
        assert_eq!(port, 25);
        assert!(probe.validate_reply(Some(addr)));
        assert!(!probe.validate_reply(Some(Ipv4Addr::new(0, 1, 2, 3))));
        assert!(!probe.validate_reply(None));
    }

    #[test]
    fn first_failure_issues_probe_and_validates_reply() {
        let guard = Arc::new(Mutex::new(PathBiasState::new()));
        let mut circ = PathBiasCircuitState::new(Arc::clone(&guard));
        circ.note_build_success();

        let sid = StreamId::new(1).unwrap();
        let probe = circ.issue_probe(sid).expect("first failure always probes");
        let (addr, _port) = probe.target();

        assert!(circ.check_probe_reply(sid, Some(IpAddr::V4(addr))));
        assert_eq!(guard.lock().unwrap().use_success_pct(), Some(100));
    }

    #[test]
    fn mismatched_probe_reply_marks_unusable() {
        let guard = Arc::new(Mutex::new(PathBiasState::new()));
        let mut circ = PathBiasCircuitState::new(Arc::clone(&guard));

        let sid = StreamId::new(1).unwrap();
        circ.issue_probe(sid).unwrap();
        assert!(circ.check_probe_reply(sid, None));
        assert_eq!(guard.lock().unwrap().use_success_pct(), Some(0));
    }

    #[test]
    fn a_successful_stream_suppresses_further_probes() {
        let guard = Arc::new(Mutex::new(PathBiasState::new()));
        let mut circ = PathBiasCircuitState::new(Arc::clone(&guard));
        circ.note_stream_success();

        let sid = StreamId::new(1).unwrap();
        assert!(circ.issue_probe(sid).is_none());
    }

    #[test]
    fn unrelated_stream_id_is_not_consumed_as_probe_reply() {
        let guard = Arc::new(Mutex::new(PathBiasState::new()));
        let mut circ = PathBiasCircuitState::new(Arc::clone(&guard));

        let probe_sid = StreamId::new(1).unwrap();
        let other_sid = StreamId::new(2).unwrap();
        circ.issue_probe(probe_sid).unwrap();

        assert!(!circ.check_probe_reply(other_sid, None));
        // the pending probe is still there, waiting for its own stream id
        assert!(circ.issue_probe(probe_sid).is_none());
    }
}
