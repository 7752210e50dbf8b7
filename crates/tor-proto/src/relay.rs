//! Relay-role support shared by the circuit and channel reactors.
//!
//! The forward circuit reactor uses a [`channel_provider::ChannelProvider`]
//! to open the outgoing channel for the next hop when it re-encrypts and
//! forwards a cell that was not recognized at this hop.
//!
//! The channel-level pieces that exist only on a relay's ingress path —
//! finding the circuit a cell belongs to, fairly draining circuits' queues
//! back out onto the channel, and deciding what a freshly arrived
//! `CREATE*`/`DESTROY` cell should do — live in [`circuit_table`],
//! [`cell_queue`], [`mux`], and [`dispatch`] respectively. These are
//! deliberately plain, non-async types: the channel reactor (which does
//! own the socket and the event loop) calls into them and performs the
//! actual I/O and circuit-table mutation itself, matching this crate's
//! "caller performs the close" error-propagation style.
//!
//! [`create`] and [`onionskin`] cover what happens once [`dispatch`] has
//! accepted a `CREATE*` cell: unwrapping the cell into a handshake request,
//! handing it to an [`onionskin::OnionskinResponder`], and wrapping the
//! response back into a `CREATED*` cell. [`server`] is where all of the
//! above are actually driven from a running channel reactor; see its
//! module docs and `DESIGN.md` for what is wired up and what still isn't
//! (a concrete cryptographic [`onionskin::OnionskinResponder`], and full
//! per-hop decrypt/recognize/forward once a circuit is open).

#[allow(unreachable_pub)] // TODO(relay): use in tor-chanmgr(?)
pub mod channel_provider;
pub(crate) mod cell_queue;
pub(crate) mod circuit_table;
pub(crate) mod create;
pub(crate) mod dispatch;
pub(crate) mod mux;
pub(crate) mod onionskin;
pub(crate) mod server;
