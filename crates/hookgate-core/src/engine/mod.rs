//! Protocol engine abstraction.
//!
//! The messaging protocol (handshake, encryption, multi-device sync) is opaque to the
//! core. Adapter crates implement these ports; the core only drives them.

pub mod port;
pub mod types;
