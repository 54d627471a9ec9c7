use std::sync::atomic::{AtomicU64, Ordering};

use pouch_core::GatewayError;

/// Gateway-wide counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct GatewayStats {
    connections: AtomicU64,
    connect_failures: AtomicU64,
    exchanges_completed: AtomicU64,
    failures_exhausted: AtomicU64,
    failures_protocol: AtomicU64,
    failures_transport: AtomicU64,
    failures_cloud: AtomicU64,
    stale_restarts: AtomicU64,
    server_cert_writes: AtomicU64,
    device_certs_submitted: AtomicU64,
    uplink_bytes: AtomicU64,
    downlink_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStatsSnapshot {
    pub connections: u64,
    pub connect_failures: u64,
    pub exchanges_completed: u64,
    pub failures_exhausted: u64,
    pub failures_protocol: u64,
    pub failures_transport: u64,
    pub failures_cloud: u64,
    pub stale_restarts: u64,
    pub server_cert_writes: u64,
    pub device_certs_submitted: u64,
    pub uplink_bytes: u64,
    pub downlink_bytes: u64,
}

impl GatewayStatsSnapshot {
    pub fn failures(&self) -> u64 {
        self.failures_exhausted + self.failures_protocol + self.failures_transport + self.failures_cloud
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl GatewayStats {
    pub fn record_connection(&self) {
        bump(&self.connections, 1);
    }

    pub fn record_connect_failure(&self) {
        bump(&self.connect_failures, 1);
    }

    pub fn record_completed(&self) {
        bump(&self.exchanges_completed, 1);
    }

    pub fn record_failure(&self, err: &GatewayError) {
        let counter = match err {
            GatewayError::Exhausted(_) => &self.failures_exhausted,
            GatewayError::ProtocolViolation(_) => &self.failures_protocol,
            GatewayError::TransportFailure(_) => &self.failures_transport,
            GatewayError::CloudFailure(_) => &self.failures_cloud,
            GatewayError::StaleData(_) => &self.stale_restarts,
        };
        bump(counter, 1);
    }

    pub fn record_server_cert_write(&self) {
        bump(&self.server_cert_writes, 1);
    }

    pub fn record_device_cert(&self) {
        bump(&self.device_certs_submitted, 1);
    }

    pub fn add_uplink_bytes(&self, len: usize) {
        bump(&self.uplink_bytes, len as u64);
    }

    pub fn add_downlink_bytes(&self, len: usize) {
        bump(&self.downlink_bytes, len as u64);
    }

    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        GatewayStatsSnapshot {
            connections: load(&self.connections),
            connect_failures: load(&self.connect_failures),
            exchanges_completed: load(&self.exchanges_completed),
            failures_exhausted: load(&self.failures_exhausted),
            failures_protocol: load(&self.failures_protocol),
            failures_transport: load(&self.failures_transport),
            failures_cloud: load(&self.failures_cloud),
            stale_restarts: load(&self.stale_restarts),
            server_cert_writes: load(&self.server_cert_writes),
            device_certs_submitted: load(&self.device_certs_submitted),
            uplink_bytes: load(&self.uplink_bytes),
            downlink_bytes: load(&self.downlink_bytes),
        }
    }
}
