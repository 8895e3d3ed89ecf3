//! realize-lib: installables resolution and build orchestration.
//!
//! This crate turns command-line references into built store paths:
//! - `installable`: parsing references, modifying their values, resolving
//!   them to derived paths and building those in one batch
//! - `flake`: flake references, registries, lock files and locking
//! - `eval`: the Lua evaluator and its attribute cache
//! - `store`: store paths, derivations and the local build store
//! - `derived`: derived paths and their built counterparts

pub mod consts;
pub mod derived;
pub mod error;
pub mod eval;
pub mod flake;
pub mod installable;
pub mod placeholder;
pub mod platform;
pub mod store;
pub mod util;
