//! Shared utilities.
//!
//! Content hashing, plus helpers for the crate's unit tests.

pub mod hash;

#[cfg(test)]
pub mod testutil;
