//! Process-wide configuration shared by the SpiralTorch adaptation crates.
//!
//! Two concerns live here: reproducible random number generation
//! ([`determinism`]) and the tracing subscriber used by binaries
//! ([`tracing`]). Library crates only ever read from these modules; installing
//! a subscriber or pinning a seed is left to the executable.

pub mod determinism;
pub mod tracing;
