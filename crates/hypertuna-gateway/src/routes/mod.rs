//! HTTP route modules for the gateway edge.

pub mod blind_peer;
#[cfg(feature = "escrow-service")]
pub mod escrow;
pub mod relays;
pub mod sys;
pub mod tokens;
