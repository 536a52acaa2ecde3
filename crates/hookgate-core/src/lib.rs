//! Core of the hookgate messaging gateway.
//!
//! Owns per-tenant session lifecycles, pairing and event dispatch. Persistence, the
//! protocol engine, the work queue and webhook transport sit behind ports (traits)
//! implemented in adapter crates.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logging;
pub mod media;
pub mod pairing;
pub mod qr;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod store;
pub mod usage;
pub mod utils;
pub mod webhook;

#[cfg(test)]
pub(crate) mod test_support;

pub use errors::{Error, Result};
