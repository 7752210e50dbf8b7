//! Sendme-window-based flow control.

pub(crate) mod state;
