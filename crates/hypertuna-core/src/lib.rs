//! Core library for the Hypertuna gateway.
//!
//! Contains the request-signing and sealed-payload primitives, the token
//! service, the lease vault, the escrow client, the relay registry, the
//! dispatcher, the blind-peer mirror, and the discovery advertiser. This
//! crate depends on `hypertuna-storage` for the key-value backend trait and
//! knows nothing about HTTP routing or the WebSocket edge.

pub mod crypto;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod escrow;
pub mod mirror;
pub mod registry;
pub mod sealed;
pub mod signing;
pub mod telemetry;
pub mod token;
pub mod vault;
