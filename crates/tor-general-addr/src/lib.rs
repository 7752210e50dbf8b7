//! Helpers for manipulating addresses that may be either AF_INET, AF_INET6,
//! or AF_UNIX.
//!
//! This crate exists so that code elsewhere in Arti can treat these address
//! families uniformly, without needing every caller to special-case AF_UNIX
//! support (which isn't available on every platform).

pub mod general;
pub mod unix;
