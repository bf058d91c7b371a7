//! Shared utilities.
pub mod ports;

pub use ports::*;
