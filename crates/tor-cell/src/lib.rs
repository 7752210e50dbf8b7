//! Coding and decoding for the cell types that make up Tor's protocol.
//!
//! This crate implements two encodings:
//!
//!   * The cells that are sent between relays (or between a client and a
//!     relay) over a channel.  These cells each specify what circuit they
//!     apply to, and specify an operation to perform on that circuit, or
//!     relay data along that circuit. They are implemented by the
//!     [`chancell`] module.
//!
//!   * The cells that are sent between relays (or between a client and a
//!     relay) along a particular circuit, embedded within a `RELAY` or
//!     `RELAY_EARLY` channel cell. These "relay cells" are finer-grained,
//!     and can specify stream IDs.  They are implemented by the
//!     [`relaycell`] module.
//!
//! These two kinds of cells are distinct from, and should not be confused
//! with, the notion of a "cell" at the TLS layer: this crate isn't about
//! TLS connections.

pub mod chancell;
pub mod relaycell;
pub mod restrict;
mod slicewriter;

mod err;

pub use err::Error;

/// Alias for the Result type returned by many methods in this crate.
pub type Result<T> = std::result::Result<T, Error>;
