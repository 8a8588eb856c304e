//! Crate-wide constants and defaults.

mod constants;

pub use constants::*;
