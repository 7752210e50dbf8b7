//! Stream-level flow control: sendme-window-based and XON/XOFF-based.

pub(crate) mod params;
pub(crate) mod state;
mod window;
#[cfg_attr(not(feature = "flowctl-cc"), allow(dead_code))]
mod xon_xoff;
