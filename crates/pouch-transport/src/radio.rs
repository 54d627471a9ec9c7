use std::collections::VecDeque;
use std::sync::mpsc;

use bytes::Bytes;
use pouch_core::{AttrHandle, ConnHandle, DisconnectReason, PeerAddr};
use uuid::Uuid;

/// Advertising PDU class of one scan report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvKind {
    ConnectableUndirected,
    ConnectableDirected,
    ScanResponse,
    NonConnectable,
}

impl AdvKind {
    /// Whether a central may initiate a connection from this report.
    pub fn is_connectable(self) -> bool {
        !matches!(self, AdvKind::NonConnectable)
    }
}

/// One advertisement or scan response seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvReport {
    pub addr: PeerAddr,
    pub rssi: i8,
    pub kind: AdvKind,
    /// Service data elements keyed by full 128-bit UUID.
    pub service_data: Vec<(Uuid, Bytes)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub handle: AttrHandle,
    pub end_handle: AttrHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub value_handle: AttrHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDescriptor {
    pub uuid: Uuid,
    pub handle: AttrHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverRequest {
    /// Primary services matching `uuid`.
    PrimaryService { uuid: Uuid },
    /// All characteristics declared within a handle range.
    Characteristics { start: AttrHandle, end: AttrHandle },
    /// All descriptors within a handle range.
    Descriptors { start: AttrHandle, end: AttrHandle },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverResult {
    Services(Vec<DiscoveredService>),
    Characteristics(Vec<DiscoveredCharacteristic>),
    Descriptors(Vec<DiscoveredDescriptor>),
}

/// One GATT operation. A connection has at most one outstanding at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    Discover(DiscoverRequest),
    Read { handle: AttrHandle },
    Write { handle: AttrHandle, data: Bytes },
    Subscribe {
        value_handle: AttrHandle,
        ccc_handle: AttrHandle,
    },
}

/// ATT error code reported for a failed GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttError(pub u8);

impl AttError {
    pub const ATTRIBUTE_NOT_FOUND: AttError = AttError(0x0A);
    pub const UNLIKELY: AttError = AttError(0x0E);

    pub fn is_not_found(self) -> bool {
        self == Self::ATTRIBUTE_NOT_FOUND
    }
}

impl std::fmt::Display for AttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "att error 0x{:02x}", self.0)
    }
}

/// Completion and link events produced by a radio backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    DeviceFound(AdvReport),
    Connected {
        conn: ConnHandle,
        addr: PeerAddr,
        mtu: usize,
    },
    ConnectFailed {
        addr: PeerAddr,
        reason: DisconnectReason,
    },
    Disconnected {
        conn: ConnHandle,
        reason: DisconnectReason,
    },
    MtuUpdated {
        conn: ConnHandle,
        mtu: usize,
    },
    Discovered {
        conn: ConnHandle,
        result: Result<DiscoverResult, AttError>,
    },
    ReadComplete {
        conn: ConnHandle,
        result: Result<Bytes, AttError>,
    },
    WriteComplete {
        conn: ConnHandle,
        result: Result<(), AttError>,
    },
    SubscribeComplete {
        conn: ConnHandle,
        result: Result<(), AttError>,
    },
    Notification {
        conn: ConnHandle,
        handle: AttrHandle,
        data: Bytes,
    },
}

impl RadioEvent {
    /// Connection the event belongs to, if it is link-scoped.
    pub fn conn(&self) -> Option<ConnHandle> {
        match self {
            RadioEvent::DeviceFound(_) | RadioEvent::ConnectFailed { .. } => None,
            RadioEvent::Connected { conn, .. }
            | RadioEvent::Disconnected { conn, .. }
            | RadioEvent::MtuUpdated { conn, .. }
            | RadioEvent::Discovered { conn, .. }
            | RadioEvent::ReadComplete { conn, .. }
            | RadioEvent::WriteComplete { conn, .. }
            | RadioEvent::SubscribeComplete { conn, .. }
            | RadioEvent::Notification { conn, .. } => Some(*conn),
        }
    }
}

/// Receiving side for radio events; backends call it from their own context.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: RadioEvent);
}

impl EventSink for mpsc::Sender<RadioEvent> {
    fn emit(&self, event: RadioEvent) {
        let _ = self.send(event);
    }
}

/// Central-role radio contract used by the gateway.
///
/// Every call only queues work and returns immediately; results come back
/// later as `RadioEvent`s.
pub trait Radio {
    /// Backend-specific submission error.
    type Error: std::fmt::Display;

    fn start_scan(&mut self) -> Result<(), Self::Error>;
    fn stop_scan(&mut self) -> Result<(), Self::Error>;
    fn connect(&mut self, addr: &PeerAddr) -> Result<(), Self::Error>;
    fn disconnect(&mut self, conn: ConnHandle, reason: DisconnectReason)
        -> Result<(), Self::Error>;
    /// Issues one GATT operation; its completion arrives as an event.
    fn submit(&mut self, conn: ConnHandle, request: GattRequest) -> Result<(), Self::Error>;
}

/// Calls a `MockRadio` recorded, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan,
    StopScan,
    Connect(PeerAddr),
    Disconnect(ConnHandle, DisconnectReason),
    Submit(ConnHandle, GattRequest),
}

/// Recording radio for tests and simulations.
#[derive(Debug, Default)]
pub struct MockRadio {
    calls: Vec<RadioCall>,
    fail_next: VecDeque<&'static str>,
    scanning: bool,
}

impl MockRadio {
    /// Makes the next call fail with `reason`.
    pub fn fail_next(&mut self, reason: &'static str) {
        self.fail_next.push_back(reason);
    }

    /// Drains and returns all calls captured so far.
    pub fn take_calls(&mut self) -> Vec<RadioCall> {
        std::mem::take(&mut self.calls)
    }

    /// Drains captured calls, keeping only GATT submissions.
    pub fn take_requests(&mut self) -> Vec<(ConnHandle, GattRequest)> {
        self.take_calls()
            .into_iter()
            .filter_map(|call| match call {
                RadioCall::Submit(conn, request) => Some((conn, request)),
                _ => None,
            })
            .collect()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    fn record(&mut self, call: RadioCall) -> Result<(), &'static str> {
        if let Some(reason) = self.fail_next.pop_front() {
            return Err(reason);
        }
        match call {
            RadioCall::StartScan => self.scanning = true,
            RadioCall::StopScan => self.scanning = false,
            _ => {}
        }
        self.calls.push(call);
        Ok(())
    }
}

impl Radio for MockRadio {
    type Error = &'static str;

    fn start_scan(&mut self) -> Result<(), Self::Error> {
        self.record(RadioCall::StartScan)
    }

    fn stop_scan(&mut self) -> Result<(), Self::Error> {
        self.record(RadioCall::StopScan)
    }

    fn connect(&mut self, addr: &PeerAddr) -> Result<(), Self::Error> {
        self.record(RadioCall::Connect(addr.clone()))
    }

    fn disconnect(
        &mut self,
        conn: ConnHandle,
        reason: DisconnectReason,
    ) -> Result<(), Self::Error> {
        self.record(RadioCall::Disconnect(conn, reason))
    }

    fn submit(&mut self, conn: ConnHandle, request: GattRequest) -> Result<(), Self::Error> {
        self.record(RadioCall::Submit(conn, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_radio_records_calls_in_order() {
        let mut radio = MockRadio::default();
        radio.start_scan().unwrap();
        radio.stop_scan().unwrap();
        radio
            .submit(ConnHandle(0), GattRequest::Read { handle: AttrHandle(7) })
            .unwrap();

        assert!(!radio.is_scanning());
        assert_eq!(
            radio.take_calls(),
            vec![
                RadioCall::StartScan,
                RadioCall::StopScan,
                RadioCall::Submit(ConnHandle(0), GattRequest::Read { handle: AttrHandle(7) }),
            ]
        );
        assert!(radio.take_calls().is_empty());
    }

    #[test]
    fn mock_radio_injected_failure_is_not_recorded() {
        let mut radio = MockRadio::default();
        radio.fail_next("busy");
        assert_eq!(radio.start_scan(), Err("busy"));
        assert!(!radio.is_scanning());
        assert!(radio.take_calls().is_empty());
        assert!(radio.start_scan().is_ok());
    }

    #[test]
    fn event_conn_is_reported_for_link_events() {
        let ev = RadioEvent::WriteComplete {
            conn: ConnHandle(3),
            result: Ok(()),
        };
        assert_eq!(ev.conn(), Some(ConnHandle(3)));
        let ev = RadioEvent::ConnectFailed {
            addr: PeerAddr::new("aa"),
            reason: DisconnectReason::ConnectionTimeout,
        };
        assert_eq!(ev.conn(), None);
    }
}
