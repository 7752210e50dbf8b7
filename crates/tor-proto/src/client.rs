//! Origin-role (client) specific circuit support.
//!
//! Everything that is common to both circuit roles — cell codec, layered
//! crypto, the cell queue and mux, stream demultiplexing, flow and
//! congestion control — lives directly under [`crate::circuit`] and
//! [`crate::channel`]. This module holds only the origin-specific pieces
//! that the shared reactor reaches into behind `crate::client::circuit`.

pub(crate) mod circuit;
