//! Initial cell-type demultiplexer for cells arriving on a relay channel.
//!
//! This module codifies the validation rules of §4.6: what makes a
//! `CREATE*` cell acceptable to open a new relay circuit, how many
//! `RELAY_EARLY` cells a circuit may send before we start refusing further
//! `EXTEND`s, and the direction check that makes an inbound `RELAY_EARLY`
//! fatal. It deliberately does not own any async I/O: [`classify`] and
//! [`validate_create`] are plain functions the channel reactor calls before
//! acting on a cell, matching the "caller performs the close" propagation
//! style used throughout this crate (see [`crate::util::err::ReactorError`]).

use tor_cell::chancell::{CircId, ChanCmd};

/// How many `RELAY_EARLY` cells an origin is initially permitted to send on
/// a freshly built circuit.
///
/// Matches the fixed budget named in §4.6; a circuit that reaches zero may
/// still forward ordinary `RELAY` cells, but a further `EXTEND`/`EXTEND2`
/// sent as `RELAY_EARLY` is refused.
pub(crate) const INITIAL_RELAY_EARLY_BUDGET: u8 = 8;

/// The broad class of action the channel reactor should take for an
/// incoming cell, as decided purely from its command byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CommandClass {
    /// `CREATE`, `CREATE_FAST`, or `CREATE2`: request to open a new
    /// relay-role circuit.
    Create,
    /// `CREATED`, `CREATED_FAST`, or `CREATED2`: a handshake reply headed
    /// back to an origin circuit (or, at a relay, to be repackaged as
    /// `EXTENDED`).
    Created,
    /// `RELAY`: an ordinary relay cell.
    Relay,
    /// `RELAY_EARLY`: a relay cell that is only legal outbound (towards
    /// the exit) and only while the sending circuit's early-cell budget
    /// is not exhausted.
    RelayEarly,
    /// `DESTROY`: tear down the circuit named in the cell.
    Destroy,
    /// Anything else (padding, versions/netinfo, vpadding, ...) — not
    /// part of the per-circuit demultiplex; handled elsewhere in the
    /// channel reactor.
    Other,
}

/// Classify `cmd` for the purposes of per-circuit dispatch.
pub(crate) fn classify(cmd: ChanCmd) -> CommandClass {
    match cmd {
        ChanCmd::CREATE | ChanCmd::CREATE_FAST | ChanCmd::CREATE2 => CommandClass::Create,
        ChanCmd::CREATED | ChanCmd::CREATED_FAST | ChanCmd::CREATED2 => CommandClass::Created,
        ChanCmd::RELAY => CommandClass::Relay,
        ChanCmd::RELAY_EARLY => CommandClass::RelayEarly,
        ChanCmd::DESTROY => CommandClass::Destroy,
        _ => CommandClass::Other,
    }
}

/// Direction a cell travelled relative to this relay.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Direction {
    /// From the previous hop (closer to the client) towards us.
    Inbound,
    /// From the next hop (closer to the exit) towards us.
    Outbound,
}

/// Why a `CREATE*` cell was refused.
///
/// Every variant here corresponds to one of the rejection rules listed in
/// §4.6; none of them are fatal to the *channel* (only the attempted
/// circuit creation is refused).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CreateRejection {
    /// The cell's circuit-id was zero, which addresses the channel as a
    /// whole rather than any circuit.
    ZeroCircId,
    /// The circuit-id is already in use on this channel.
    IdInUse,
    /// We are not configured to run in server (relay) mode.
    NotServerMode,
    /// The channel is to a client, which must never originate a `CREATE*`.
    FromClient,
    /// The circuit-id's high bit does not match the partition this channel
    /// is supposed to allocate ids from.
    PartitionMismatch,
    /// The onionskin type named in the cell is no longer supported (e.g.
    /// legacy TAP).
    UnsupportedOnionskin,
}

/// Whether CREATE cells using `circ_id`'s partition are acceptable on a
/// channel that allocates circuit ids from the `high` partition or not.
///
/// Relays partition the circuit-id space by which side initiated the
/// channel, exactly as `channel::circmap::CircIdRange` does for locally
/// originated circuits; this is the same check applied to a peer's
/// proposed id on an inbound `CREATE*`.
fn partition_matches(circ_id: CircId, expect_high: bool) -> bool {
    let v: u32 = circ_id.into();
    let high_bit_set = v & 0x8000_0000 != 0;
    high_bit_set == expect_high
}

/// Everything [`validate_create`] needs to know about the channel and
/// circuit-id a `CREATE*` cell arrived with, independent of the cell's
/// body.
#[derive(Copy, Clone, Debug)]
pub(crate) struct CreateContext {
    /// The circuit-id named in the cell (`None` if it decoded as zero).
    pub(crate) circ_id: Option<CircId>,
    /// Whether this circuit-id is already occupied on this channel, per
    /// the relay's [`super::circuit_table::CircuitTable`].
    pub(crate) id_in_use: bool,
    /// Whether we are running with relay (server) functionality enabled.
    pub(crate) server_mode: bool,
    /// Whether the channel's peer is a client (as opposed to another
    /// relay).
    pub(crate) peer_is_client: bool,
    /// Whether this channel allocates circuit ids from the high partition.
    pub(crate) expect_high_partition: bool,
    /// Whether the onionskin type named in the cell is one we still
    /// support (modern ntor-family and "fast"; legacy TAP is refused).
    pub(crate) onionskin_supported: bool,
}

/// Validate a `CREATE*` cell against the rules of §4.6, in the order they
/// are listed there.
///
/// Returns `Ok(circ_id)` if the circuit may be created, or the first
/// applicable [`CreateRejection`] otherwise. Every rejection here results
/// in the cell being dropped and logged at protocol-warn level; none of
/// them tear down the channel.
pub(crate) fn validate_create(ctx: &CreateContext) -> Result<CircId, CreateRejection> {
    let circ_id = ctx.circ_id.ok_or(CreateRejection::ZeroCircId)?;
    if ctx.id_in_use {
        return Err(CreateRejection::IdInUse);
    }
    if !ctx.server_mode {
        return Err(CreateRejection::NotServerMode);
    }
    if ctx.peer_is_client {
        return Err(CreateRejection::FromClient);
    }
    if !partition_matches(circ_id, ctx.expect_high_partition) {
        return Err(CreateRejection::PartitionMismatch);
    }
    if !ctx.onionskin_supported {
        return Err(CreateRejection::UnsupportedOnionskin);
    }
    Ok(circ_id)
}

/// Tracks how many more `RELAY_EARLY` cells a circuit may send outbound,
/// and rejects `RELAY_EARLY` arriving inbound outright.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RelayEarlyBudget {
    /// Remaining outbound `RELAY_EARLY` cells this circuit may send.
    remaining: u8,
}

impl Default for RelayEarlyBudget {
    fn default() -> Self {
        Self {
            remaining: INITIAL_RELAY_EARLY_BUDGET,
        }
    }
}

/// What to do with a `RELAY_EARLY` cell, decided by [`RelayEarlyBudget::check`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RelayEarlyOutcome {
    /// Budget was available (or irrelevant, for inbound checks that
    /// already failed); the cell is processed as `RELAY_EARLY`.
    Allowed,
    /// The direction makes this cell always fatal: an inbound
    /// `RELAY_EARLY` closes the circuit with `TORPROTOCOL` regardless of
    /// budget.
    FatalWrongDirection,
    /// The circuit's budget is exhausted. Not fatal by itself (an
    /// ordinary `RELAY_EARLY` data cell is just warned about and
    /// dropped); callers that are about to act on an `EXTEND`/`EXTEND2`
    /// inside this cell should refuse it.
    BudgetExhausted,
}

impl RelayEarlyBudget {
    /// Check (and, if allowed, consume) budget for a `RELAY_EARLY` cell
    /// travelling in `direction`.
    pub(crate) fn check(&mut self, direction: Direction) -> RelayEarlyOutcome {
        if direction == Direction::Inbound {
            return RelayEarlyOutcome::FatalWrongDirection;
        }
        if self.remaining == 0 {
            return RelayEarlyOutcome::BudgetExhausted;
        }
        self.remaining -= 1;
        RelayEarlyOutcome::Allowed
    }

    /// Remaining budget, for statistics/testing.
    pub(crate) fn remaining(&self) -> u8 {
        self.remaining
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn base_ctx() -> CreateContext {
        CreateContext {
            circ_id: CircId::new(0x8000_0001),
            id_in_use: false,
            server_mode: true,
            peer_is_client: false,
            expect_high_partition: true,
            onionskin_supported: true,
        }
    }

    #[test]
    fn classify_matches_spec_table() {
        assert_eq!(classify(ChanCmd::CREATE2), CommandClass::Create);
        assert_eq!(classify(ChanCmd::CREATED2), CommandClass::Created);
        assert_eq!(classify(ChanCmd::RELAY), CommandClass::Relay);
        assert_eq!(classify(ChanCmd::RELAY_EARLY), CommandClass::RelayEarly);
        assert_eq!(classify(ChanCmd::DESTROY), CommandClass::Destroy);
        assert_eq!(classify(ChanCmd::PADDING), CommandClass::Other);
    }

    #[test]
    fn valid_create_is_accepted() {
        let ctx = base_ctx();
        assert_eq!(validate_create(&ctx), Ok(ctx.circ_id.unwrap()));
    }

    #[test]
    fn zero_circ_id_is_rejected() {
        let mut ctx = base_ctx();
        ctx.circ_id = None;
        assert_eq!(validate_create(&ctx), Err(CreateRejection::ZeroCircId));
    }

    #[test]
    fn id_in_use_is_rejected() {
        let mut ctx = base_ctx();
        ctx.id_in_use = true;
        assert_eq!(validate_create(&ctx), Err(CreateRejection::IdInUse));
    }

    #[test]
    fn non_server_mode_is_rejected() {
        let mut ctx = base_ctx();
        ctx.server_mode = false;
        assert_eq!(validate_create(&ctx), Err(CreateRejection::NotServerMode));
    }

    #[test]
    fn client_peer_is_rejected() {
        let mut ctx = base_ctx();
        ctx.peer_is_client = true;
        assert_eq!(validate_create(&ctx), Err(CreateRejection::FromClient));
    }

    #[test]
    fn partition_mismatch_is_rejected() {
        let mut ctx = base_ctx();
        ctx.circ_id = CircId::new(1); // high bit clear
        assert_eq!(
            validate_create(&ctx),
            Err(CreateRejection::PartitionMismatch)
        );
    }

    #[test]
    fn unsupported_onionskin_is_rejected() {
        let mut ctx = base_ctx();
        ctx.onionskin_supported = false;
        assert_eq!(
            validate_create(&ctx),
            Err(CreateRejection::UnsupportedOnionskin)
        );
    }

    #[test]
    fn inbound_relay_early_is_always_fatal() {
        let mut budget = RelayEarlyBudget::default();
        assert_eq!(
            budget.check(Direction::Inbound),
            RelayEarlyOutcome::FatalWrongDirection
        );
        // the budget itself is untouched by a rejected direction check
        assert_eq!(budget.remaining(), INITIAL_RELAY_EARLY_BUDGET);
    }

    #[test]
    fn ninth_outbound_relay_early_exhausts_budget() {
        let mut budget = RelayEarlyBudget::default();
        for _ in 0..INITIAL_RELAY_EARLY_BUDGET {
            assert_eq!(
                budget.check(Direction::Outbound),
                RelayEarlyOutcome::Allowed
            );
        }
        assert_eq!(
            budget.check(Direction::Outbound),
            RelayEarlyOutcome::BudgetExhausted
        );
    }
}
