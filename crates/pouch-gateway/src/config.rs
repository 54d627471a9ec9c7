use pouch_core::{GatewayError, GatewayLimits, PeerAddr};
use pouch_transport_ble::protocol::POUCH_GATT_VERSION;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub limits: GatewayLimits,
    /// Addresses the gateway may connect to; empty admits every device.
    pub allowlist: Vec<PeerAddr>,
    /// GATT protocol revision advertised devices must match.
    pub protocol_version: u8,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            limits: GatewayLimits::default(),
            allowlist: Vec::new(),
            protocol_version: POUCH_GATT_VERSION,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        self.limits.validate()
    }
}
