//! Pouch gateway core.
//!
//! Scans for Pouch devices, connects to the ones requesting a sync and runs
//! the GATT exchange: certificate exchange, uplink forwarding to the cloud
//! and downlink delivery back to the device.

pub mod block;
pub mod cert;
pub mod config;
pub mod connection;
pub mod downlink;
pub mod gateway;
pub mod scan;
pub mod stats;
pub mod table;
pub mod uplink;

pub use block::{Block, BlockPool, PoolError};
pub use cert::{CertError, ServerCertStore};
pub use config::GatewayConfig;
pub use connection::{Action, ConnEvent, NodeConnection, Phase};
pub use downlink::{DownlinkSink, DownlinkStream};
pub use gateway::{event_channel, EventSender, Gateway, GatewayEvent};
pub use scan::{IgnoreReason, ScanDecision, ScanPolicy};
pub use stats::{GatewayStats, GatewayStatsSnapshot};
pub use uplink::Uplink;
