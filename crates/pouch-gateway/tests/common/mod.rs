//! Simulated Pouch peripheral driven through `MockRadio`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use bytes::Bytes;
use pouch_core::{AttrHandle, ConnHandle, DisconnectReason, GatewayLimits, PeerAddr};
use pouch_gateway::{event_channel, EventSender, Gateway, GatewayConfig, GatewayEvent, ServerCertStore};
use pouch_transport::cloud::{InMemoryCloud, ServerCertificate};
use pouch_transport::radio::{
    AttError, DiscoverRequest, DiscoverResult, DiscoveredCharacteristic, DiscoveredDescriptor,
    DiscoveredService, GattRequest, MockRadio, RadioCall, RadioEvent,
};
use pouch_transport_ble::packetizer::{decode, encode_all};
use pouch_transport_ble::protocol::{
    Characteristic, CCC_UUID, LEGACY_SERVICE_UUID, SERVICE_UUID,
};

pub const SERVICE: AttrHandle = AttrHandle(0x10);
pub const SERVICE_END: AttrHandle = AttrHandle(0x1b);
pub const INFO: AttrHandle = AttrHandle(0x12);
pub const DOWNLINK: AttrHandle = AttrHandle(0x14);
pub const UPLINK: AttrHandle = AttrHandle(0x16);
pub const UPLINK_CCC: AttrHandle = AttrHandle(0x17);
pub const SERVER_CERT: AttrHandle = AttrHandle(0x19);
pub const DEVICE_CERT: AttrHandle = AttrHandle(0x1b);

/// One device's GATT server, answering requests the gateway submits.
#[derive(Debug)]
pub struct SimDevice {
    pub conn: ConnHandle,
    pub addr: PeerAddr,
    pub mtu: usize,
    pub legacy_uuid: bool,
    pub notify: bool,
    pub certs: bool,
    /// Deliver every uplink notification before acknowledging the subscribe.
    pub notify_before_ack: bool,
    pub uplink: VecDeque<Bytes>,
    pub server_serial: VecDeque<Bytes>,
    pub device_cert: VecDeque<Bytes>,
    pub server_cert_written: Vec<u8>,
    pub server_cert_frames: usize,
    pub downlink: Vec<u8>,
    pub downlink_done: bool,
    pub disconnected: Option<DisconnectReason>,
    /// Installs this certificate once the given number of server
    /// certificate frames were written.
    pub bump_cert: Option<(usize, ServerCertStore, ServerCertificate)>,
}

impl SimDevice {
    pub fn new(conn: u16, addr: &str) -> Self {
        Self {
            conn: ConnHandle(conn),
            addr: PeerAddr::new(addr),
            mtu: 23,
            legacy_uuid: false,
            notify: true,
            certs: true,
            notify_before_ack: false,
            uplink: VecDeque::new(),
            server_serial: VecDeque::new(),
            device_cert: VecDeque::new(),
            server_cert_written: Vec::new(),
            server_cert_frames: 0,
            downlink: Vec::new(),
            downlink_done: false,
            disconnected: None,
            bump_cert: None,
        }
    }

    fn frame_capacity(&self) -> usize {
        GatewayLimits::default().frame_capacity(self.mtu)
    }

    pub fn with_uplink(mut self, payload: &[u8]) -> Self {
        self.uplink = encode_all(payload, self.frame_capacity()).unwrap().into();
        self
    }

    pub fn with_server_serial(mut self, serial: &[u8]) -> Self {
        self.server_serial = if serial.is_empty() {
            VecDeque::from([Bytes::new()])
        } else {
            encode_all(serial, self.frame_capacity()).unwrap().into()
        };
        self
    }

    pub fn with_device_cert(mut self, cert: &[u8]) -> Self {
        self.device_cert = if cert.is_empty() {
            VecDeque::from([Bytes::new()])
        } else {
            encode_all(cert, self.frame_capacity()).unwrap().into()
        };
        self
    }

    pub fn connected_event(&self) -> RadioEvent {
        RadioEvent::Connected {
            conn: self.conn,
            addr: self.addr.clone(),
            mtu: self.mtu,
        }
    }

    fn characteristics(&self) -> Vec<DiscoveredCharacteristic> {
        let mut list = vec![
            (Characteristic::Info, INFO),
            (Characteristic::Downlink, DOWNLINK),
            (Characteristic::Uplink, UPLINK),
        ];
        if self.certs {
            list.push((Characteristic::ServerCert, SERVER_CERT));
            list.push((Characteristic::DeviceCert, DEVICE_CERT));
        }
        list.into_iter()
            .map(|(c, handle)| DiscoveredCharacteristic {
                uuid: c.uuid(),
                value_handle: handle,
            })
            .collect()
    }

    /// Events the device produces in answer to one request.
    pub fn answer(&mut self, request: GattRequest) -> Vec<RadioEvent> {
        let conn = self.conn;
        match request {
            GattRequest::Discover(DiscoverRequest::PrimaryService { uuid }) => {
                let served = if self.legacy_uuid {
                    LEGACY_SERVICE_UUID
                } else {
                    SERVICE_UUID
                };
                let result = if uuid == served {
                    Ok(DiscoverResult::Services(vec![DiscoveredService {
                        uuid,
                        handle: SERVICE,
                        end_handle: SERVICE_END,
                    }]))
                } else {
                    Err(AttError::ATTRIBUTE_NOT_FOUND)
                };
                vec![RadioEvent::Discovered { conn, result }]
            }
            GattRequest::Discover(DiscoverRequest::Characteristics { .. }) => {
                vec![RadioEvent::Discovered {
                    conn,
                    result: Ok(DiscoverResult::Characteristics(self.characteristics())),
                }]
            }
            GattRequest::Discover(DiscoverRequest::Descriptors { start, end }) => {
                let result = if self.notify && start <= UPLINK_CCC && UPLINK_CCC <= end {
                    Ok(DiscoverResult::Descriptors(vec![DiscoveredDescriptor {
                        uuid: CCC_UUID,
                        handle: UPLINK_CCC,
                    }]))
                } else {
                    Err(AttError::ATTRIBUTE_NOT_FOUND)
                };
                vec![RadioEvent::Discovered { conn, result }]
            }
            GattRequest::Read { handle } => {
                let data = match handle {
                    h if h == UPLINK => self.uplink.pop_front(),
                    h if h == SERVER_CERT => self.server_serial.pop_front(),
                    h if h == DEVICE_CERT => self.device_cert.pop_front(),
                    _ => None,
                };
                vec![RadioEvent::ReadComplete {
                    conn,
                    result: Ok(data.unwrap_or_default()),
                }]
            }
            GattRequest::Write { handle, data } => {
                let result = self.on_write(handle, &data);
                vec![RadioEvent::WriteComplete { conn, result }]
            }
            GattRequest::Subscribe { .. } => {
                let notifications = self.uplink.drain(..).map(|data| RadioEvent::Notification {
                    conn,
                    handle: UPLINK,
                    data,
                });
                let ack = RadioEvent::SubscribeComplete { conn, result: Ok(()) };
                if self.notify_before_ack {
                    notifications.chain(std::iter::once(ack)).collect()
                } else {
                    std::iter::once(ack).chain(notifications).collect()
                }
            }
        }
    }

    fn on_write(&mut self, handle: AttrHandle, frame: &[u8]) -> Result<(), AttError> {
        let packet = decode(frame).map_err(|_| AttError::UNLIKELY)?;
        if handle == SERVER_CERT {
            if packet.is_first {
                self.server_cert_written.clear();
            }
            self.server_cert_written.extend_from_slice(packet.payload);
            self.server_cert_frames += 1;
            let due = self
                .bump_cert
                .as_ref()
                .is_some_and(|(after, _, _)| *after == self.server_cert_frames);
            if due {
                if let Some((_, store, cert)) = self.bump_cert.take() {
                    store.update(&cert).unwrap();
                }
            }
            return Ok(());
        }
        if handle == DOWNLINK {
            if packet.is_first {
                self.downlink.clear();
            }
            self.downlink.extend_from_slice(packet.payload);
            self.downlink_done = packet.is_last;
            return Ok(());
        }
        Err(AttError(0x03))
    }
}

/// Gateway wired to a `MockRadio`, an in-memory cloud and simulated devices.
pub struct Harness {
    pub gateway: Gateway<MockRadio>,
    pub rx: Receiver<GatewayEvent>,
    pub events: EventSender,
    pub cloud: InMemoryCloud,
    pub certs: ServerCertStore,
    pub scan_calls: Vec<RadioCall>,
}

impl Harness {
    pub fn new(max_connections: usize) -> Self {
        let limits = GatewayLimits {
            max_connections,
            max_blocks: 4,
            max_block_size: 32,
            ..GatewayLimits::default()
        };
        let cloud = InMemoryCloud::with_block_size(32);
        let certs = ServerCertStore::new(limits.server_cert_max_len);
        let (events, rx) = event_channel();
        let config = GatewayConfig {
            limits,
            ..GatewayConfig::default()
        };
        let mut gateway = Gateway::new(
            MockRadio::default(),
            Arc::new(cloud.clone()),
            certs.clone(),
            config,
            events.clone(),
        )
        .unwrap();
        gateway.start().unwrap();
        Self {
            gateway,
            rx,
            events,
            cloud,
            certs,
            scan_calls: Vec::new(),
        }
    }

    pub fn emit(&self, event: RadioEvent) {
        self.events.send(GatewayEvent::Radio(event));
    }

    /// Runs the gateway and the devices until both sides go quiet.
    pub fn pump(&mut self, devices: &mut [&mut SimDevice]) {
        for _ in 0..10_000 {
            let handled = self.gateway.run_pending(&self.rx);
            let calls = self.gateway.radio_mut().take_calls();
            if handled == 0 && calls.is_empty() {
                return;
            }
            for call in calls {
                match call {
                    RadioCall::Submit(conn, request) => {
                        let Some(device) = devices.iter_mut().find(|d| d.conn == conn) else {
                            continue;
                        };
                        if device.disconnected.is_some() {
                            continue;
                        }
                        for event in device.answer(request) {
                            self.emit(event);
                        }
                    }
                    RadioCall::Disconnect(conn, reason) => {
                        if let Some(device) = devices.iter_mut().find(|d| d.conn == conn) {
                            device.disconnected = Some(reason);
                        }
                        self.emit(RadioEvent::Disconnected { conn, reason });
                    }
                    other => self.scan_calls.push(other),
                }
            }
        }
        panic!("gateway never settled");
    }

    /// Connects `device` and runs the exchange to quiescence.
    pub fn run_device(&mut self, device: &mut SimDevice) {
        self.emit(device.connected_event());
        self.pump(&mut [device]);
    }
}
