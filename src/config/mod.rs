//! Configuration: tuning constants and reserved on-disk names.

pub mod constants;

pub use constants::*;
