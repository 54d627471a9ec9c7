use std::collections::HashSet;

use pouch_core::PeerAddr;
use pouch_transport::radio::AdvReport;
use pouch_transport_ble::protocol::{find_pouch_adv, AdvData};

/// Why an advertisement did not lead to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotConnectable,
    NotPouch,
    IncompatibleVersion(u8),
    NoSyncRequest,
    NotAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDecision {
    Connect(AdvData),
    Ignore(IgnoreReason),
}

/// Decides which advertising devices the gateway connects to.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    version: u8,
    allowlist: HashSet<PeerAddr>,
}

impl ScanPolicy {
    pub fn new(version: u8, allowlist: impl IntoIterator<Item = PeerAddr>) -> Self {
        Self {
            version,
            allowlist: allowlist.into_iter().collect(),
        }
    }

    pub fn evaluate(&self, report: &AdvReport) -> ScanDecision {
        if !report.kind.is_connectable() {
            return ScanDecision::Ignore(IgnoreReason::NotConnectable);
        }
        if !self.allowlist.is_empty() && !self.allowlist.contains(&report.addr) {
            return ScanDecision::Ignore(IgnoreReason::NotAllowed);
        }
        let Some(adv) = find_pouch_adv(report) else {
            return ScanDecision::Ignore(IgnoreReason::NotPouch);
        };
        if adv.self_version() != self.version {
            return ScanDecision::Ignore(IgnoreReason::IncompatibleVersion(adv.self_version()));
        }
        if !adv.sync_requested() {
            return ScanDecision::Ignore(IgnoreReason::NoSyncRequest);
        }
        ScanDecision::Connect(adv)
    }
}
