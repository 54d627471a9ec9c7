//! Core Pouch gateway primitives shared across crates.
//!
//! Includes connection and attribute identifiers, the gateway's build-time
//! limits, and the base error taxonomy.

pub mod error;
pub mod limits;
pub mod types;

pub use error::GatewayError;
pub use limits::{GatewayLimits, ATT_OVERHEAD};
pub use types::{AttrHandle, ConnHandle, ConnKey, DisconnectReason, OwnerTag, PeerAddr};
