use std::time::Duration;

use crate::GatewayError;

/// ATT write header: opcode (1) + handle (2).
pub const ATT_OVERHEAD: usize = 3;

/// Sizing limits supplied by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayLimits {
    /// Simultaneous radio links, and connection table capacity.
    pub max_connections: usize,
    /// Blocks in the downlink pool.
    pub max_blocks: usize,
    /// Capacity of one pool block in bytes.
    pub max_block_size: usize,
    /// Largest server certificate the distribution buffer accepts.
    pub server_cert_max_len: usize,
    /// Largest device certificate a collection session accepts.
    pub device_cert_max_len: usize,
    /// How long a cloud-side block allocation may wait for a free block.
    pub block_alloc_timeout: Duration,
    /// Per-packet ATT overhead subtracted from the negotiated MTU.
    pub att_overhead: usize,
    /// MTU assumed until the radio reports a negotiated value.
    pub default_mtu: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            max_connections: 1,
            max_blocks: 8,
            max_block_size: 1024,
            server_cert_max_len: 2048,
            device_cert_max_len: 1024,
            block_alloc_timeout: Duration::from_secs(5),
            att_overhead: ATT_OVERHEAD,
            default_mtu: 247,
        }
    }
}

impl GatewayLimits {
    /// Largest single GATT frame for a link with the given MTU.
    pub fn frame_capacity(&self, mtu: usize) -> usize {
        mtu.saturating_sub(self.att_overhead)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.max_connections == 0 {
            return Err(GatewayError::exhausted("max_connections must be non-zero"));
        }
        if self.max_blocks == 0 || self.max_block_size == 0 {
            return Err(GatewayError::exhausted("block pool must hold at least one byte"));
        }
        if self.frame_capacity(self.default_mtu) < 2 {
            return Err(GatewayError::exhausted(
                "default MTU leaves no room for packet payload",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_capacity_subtracts_att_overhead() {
        let limits = GatewayLimits::default();
        assert_eq!(limits.frame_capacity(23), 20);
        assert_eq!(limits.frame_capacity(247), 244);
        assert_eq!(limits.frame_capacity(2), 0);
    }

    #[test]
    fn validate_rejects_degenerate_limits() {
        assert!(GatewayLimits::default().validate().is_ok());

        let no_conns = GatewayLimits {
            max_connections: 0,
            ..GatewayLimits::default()
        };
        assert!(no_conns.validate().is_err());

        let tiny_mtu = GatewayLimits {
            default_mtu: 4,
            ..GatewayLimits::default()
        };
        assert!(tiny_mtu.validate().is_err());
    }
}
