//! Per-connection GATT exchange.
//!
//! A `NodeConnection` walks one device through service discovery, the
//! certificate exchange, the uplink transfer and finally the downlink
//! transfer. It never touches the radio: each radio completion is fed in as
//! a `ConnEvent` and the connection answers with the next `Action`.

use bytes::{Bytes, BytesMut};
use pouch_core::{
    AttrHandle, ConnHandle, ConnKey, DisconnectReason, GatewayError, GatewayLimits, PeerAddr,
};
use pouch_transport::cloud::CloudTransport;
use pouch_transport::radio::{
    AttError, DiscoverRequest, DiscoverResult, DiscoveredCharacteristic, GattRequest,
};
use pouch_transport_ble::packetizer::{PacketAssembler, Packetizer};
use pouch_transport_ble::protocol::{Characteristic, CCC_UUID, SERVICE_UUIDS};
use tracing::{debug, info, trace, warn};

use crate::block::BlockPool;
use crate::cert::{CertExchange, DeviceCertCollector, ServerCertStore};
use crate::downlink::{DataAvailable, DownlinkStream};
use crate::stats::GatewayStats;
use crate::uplink::Uplink;

/// Shared resources a connection borrows while handling one event.
pub struct ConnEnv<'a> {
    pub cloud: &'a dyn CloudTransport,
    pub pool: &'a BlockPool,
    pub certs: &'a ServerCertStore,
    pub limits: &'a GatewayLimits,
    pub stats: &'a GatewayStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// Link is up; begin discovery.
    Start,
    MtuUpdated(usize),
    Discovered(Result<DiscoverResult, AttError>),
    ReadComplete(Result<Bytes, AttError>),
    WriteComplete(Result<(), AttError>),
    SubscribeComplete(Result<(), AttError>),
    Notification { handle: AttrHandle, data: Bytes },
    /// The cloud queued downlink data while the writer was parked.
    DownlinkReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Gatt(GattRequest),
    Disconnect(DisconnectReason),
    Wait,
}

/// The single GATT operation a connection may have outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    Discover,
    Read,
    Write,
    Subscribe,
}

impl PendingOp {
    fn of(request: &GattRequest) -> Self {
        match request {
            GattRequest::Discover(_) => PendingOp::Discover,
            GattRequest::Read { .. } => PendingOp::Read,
            GattRequest::Write { .. } => PendingOp::Write,
            GattRequest::Subscribe { .. } => PendingOp::Subscribe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    DiscoverService { candidate: usize },
    DiscoverCharacteristics,
    DiscoverDescriptors,
    ReadServerSerial,
    WriteServerCert,
    ReadDeviceCert,
    SubscribeUplink,
    AwaitUplink,
    ReadUplink,
    WriteDownlink,
    AwaitDownlinkData,
    Done,
    Failed,
}

/// Attribute handles discovered on the Pouch service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrHandles {
    pub service_start: AttrHandle,
    pub service_end: AttrHandle,
    pub info: AttrHandle,
    pub uplink: AttrHandle,
    pub uplink_ccc: AttrHandle,
    pub downlink: AttrHandle,
    pub server_cert: AttrHandle,
    pub device_cert: AttrHandle,
}

impl AttrHandles {
    fn set(&mut self, characteristic: Characteristic, handle: AttrHandle) {
        let slot = match characteristic {
            Characteristic::Info => &mut self.info,
            Characteristic::Uplink => &mut self.uplink,
            Characteristic::Downlink => &mut self.downlink,
            Characteristic::ServerCert => &mut self.server_cert,
            Characteristic::DeviceCert => &mut self.device_cert,
        };
        *slot = handle;
    }
}

fn read(handle: AttrHandle) -> Action {
    Action::Gatt(GattRequest::Read { handle })
}

fn write(handle: AttrHandle, data: Bytes) -> Action {
    Action::Gatt(GattRequest::Write { handle, data })
}

fn att_failure(op: &str, err: AttError) -> GatewayError {
    GatewayError::transport(format!("{op}: {err}"))
}

fn unexpected(result: &DiscoverResult) -> GatewayError {
    GatewayError::protocol(format!("unexpected discovery result {result:?}"))
}

pub struct NodeConnection {
    key: ConnKey,
    conn: ConnHandle,
    addr: PeerAddr,
    mtu: usize,
    phase: Phase,
    pending: Option<PendingOp>,
    handles: AttrHandles,
    assembler: PacketAssembler,
    cert: CertExchange,
    uplink: Option<Uplink>,
    downlink: Option<Packetizer<DownlinkStream>>,
    last_frame_sent: bool,
    uplink_finished: bool,
    waker: DataAvailable,
}

impl NodeConnection {
    pub fn new(
        key: ConnKey,
        conn: ConnHandle,
        addr: PeerAddr,
        mtu: usize,
        waker: DataAvailable,
    ) -> Self {
        Self {
            key,
            conn,
            addr,
            mtu,
            phase: Phase::Idle,
            pending: None,
            handles: AttrHandles::default(),
            assembler: PacketAssembler::default(),
            cert: CertExchange::default(),
            uplink: None,
            downlink: None,
            last_frame_sent: false,
            uplink_finished: false,
            waker,
        }
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    pub fn conn(&self) -> ConnHandle {
        self.conn
    }

    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pending(&self) -> Option<PendingOp> {
        self.pending
    }

    pub fn handles(&self) -> &AttrHandles {
        &self.handles
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Failed)
    }

    /// Advances the exchange by one event.
    ///
    /// Any error tears the connection down and asks for a disconnect.
    pub fn on_event(&mut self, event: ConnEvent, env: &ConnEnv<'_>) -> Action {
        if self.is_finished() {
            debug!(conn = %self.key, phase = ?self.phase, "event after exchange ended ignored");
            return Action::Wait;
        }
        match self.step(event, env) {
            Ok(Action::Gatt(request)) => {
                self.pending = Some(PendingOp::of(&request));
                Action::Gatt(request)
            }
            Ok(action) => action,
            Err(err) => self.fail(err, env),
        }
    }

    /// The radio refused a request this connection issued.
    pub fn on_submit_failed(&mut self, reason: &str, env: &ConnEnv<'_>) -> Action {
        self.pending = None;
        self.fail(GatewayError::transport(format!("request not submitted: {reason}")), env)
    }

    /// Link is gone; releases everything the exchange still holds.
    pub fn on_disconnected(&mut self, reason: DisconnectReason, stats: &GatewayStats) {
        if !self.is_finished() {
            let err = GatewayError::transport(format!("link lost: {reason}"));
            warn!(conn = %self.key, phase = ?self.phase, %reason, "disconnected mid-exchange");
            stats.record_failure(&err);
            self.phase = Phase::Failed;
        }
        self.teardown();
    }

    fn fail(&mut self, err: GatewayError, env: &ConnEnv<'_>) -> Action {
        warn!(
            conn = %self.key,
            addr = %self.addr,
            phase = ?self.phase,
            class = err.class(),
            %err,
            "exchange failed, disconnecting"
        );
        env.stats.record_failure(&err);
        self.teardown();
        self.phase = Phase::Failed;
        Action::Disconnect(DisconnectReason::RemoteUserTerminated)
    }

    /// Downlink abort, then uplink release, then certificate cleanup.
    fn teardown(&mut self) {
        if let Some(packetizer) = self.downlink.take() {
            let stream = packetizer.finish();
            stream.abort();
            stream.finish();
        }
        if let Some(uplink) = self.uplink.take() {
            uplink.close();
        }
        self.cert.cleanup();
        self.pending = None;
    }

    fn complete(&mut self, expected: PendingOp) -> Result<(), GatewayError> {
        match self.pending.take() {
            Some(op) if op == expected => Ok(()),
            other => Err(GatewayError::protocol(format!(
                "{expected:?} completion while {other:?} outstanding"
            ))),
        }
    }

    fn step(&mut self, event: ConnEvent, env: &ConnEnv<'_>) -> Result<Action, GatewayError> {
        match event {
            ConnEvent::Start => {
                if self.phase != Phase::Idle {
                    return Err(GatewayError::protocol("exchange started twice"));
                }
                Ok(self.discover_service(0))
            }
            ConnEvent::MtuUpdated(mtu) => {
                debug!(conn = %self.key, mtu, "mtu updated");
                self.mtu = mtu;
                Ok(Action::Wait)
            }
            ConnEvent::Discovered(result) => {
                self.complete(PendingOp::Discover)?;
                self.on_discovered(result, env)
            }
            ConnEvent::ReadComplete(result) => {
                self.complete(PendingOp::Read)?;
                self.on_read(result, env)
            }
            ConnEvent::WriteComplete(result) => {
                self.complete(PendingOp::Write)?;
                self.on_written(result, env)
            }
            ConnEvent::SubscribeComplete(result) => {
                self.complete(PendingOp::Subscribe)?;
                self.on_subscribed(result, env)
            }
            ConnEvent::Notification { handle, data } => self.on_notification(handle, &data, env),
            ConnEvent::DownlinkReady => {
                if self.phase != Phase::AwaitDownlinkData || self.pending.is_some() {
                    return Ok(Action::Wait);
                }
                self.next_downlink_frame(env)
            }
        }
    }

    fn discover_service(&mut self, candidate: usize) -> Action {
        self.phase = Phase::DiscoverService { candidate };
        Action::Gatt(GattRequest::Discover(DiscoverRequest::PrimaryService {
            uuid: SERVICE_UUIDS[candidate],
        }))
    }

    fn on_discovered(
        &mut self,
        result: Result<DiscoverResult, AttError>,
        env: &ConnEnv<'_>,
    ) -> Result<Action, GatewayError> {
        match self.phase {
            Phase::DiscoverService { candidate } => {
                let services = match result {
                    Ok(DiscoverResult::Services(services)) => services,
                    Err(err) if err.is_not_found() => Vec::new(),
                    Err(err) => return Err(att_failure("service discovery", err)),
                    Ok(other) => return Err(unexpected(&other)),
                };
                let Some(service) = services.into_iter().next() else {
                    if candidate + 1 < SERVICE_UUIDS.len() {
                        debug!(conn = %self.key, "service not found, trying legacy uuid");
                        return Ok(self.discover_service(candidate + 1));
                    }
                    return Err(GatewayError::protocol("pouch service not found"));
                };
                self.handles.service_start = service.handle;
                self.handles.service_end = service.end_handle;
                debug!(
                    conn = %self.key,
                    start = %service.handle,
                    end = %service.end_handle,
                    "pouch service discovered"
                );
                self.phase = Phase::DiscoverCharacteristics;
                Ok(Action::Gatt(GattRequest::Discover(
                    DiscoverRequest::Characteristics {
                        start: service.handle.next(),
                        end: service.end_handle,
                    },
                )))
            }
            Phase::DiscoverCharacteristics => {
                let characteristics = match result {
                    Ok(DiscoverResult::Characteristics(found)) => found,
                    Err(err) if err.is_not_found() => Vec::new(),
                    Err(err) => return Err(att_failure("characteristic discovery", err)),
                    Ok(other) => return Err(unexpected(&other)),
                };
                self.on_characteristics(characteristics, env)
            }
            Phase::DiscoverDescriptors => {
                let descriptors = match result {
                    Ok(DiscoverResult::Descriptors(found)) => found,
                    Err(err) if err.is_not_found() => Vec::new(),
                    Err(err) => return Err(att_failure("descriptor discovery", err)),
                    Ok(other) => return Err(unexpected(&other)),
                };
                if let Some(ccc) = descriptors.iter().find(|d| d.uuid == CCC_UUID) {
                    self.handles.uplink_ccc = ccc.handle;
                } else {
                    debug!(conn = %self.key, "uplink has no CCC descriptor, polling instead");
                }
                self.begin_cert_exchange(env)
            }
            phase => Err(GatewayError::protocol(format!(
                "discovery result in phase {phase:?}"
            ))),
        }
    }

    fn on_characteristics(
        &mut self,
        mut found: Vec<DiscoveredCharacteristic>,
        env: &ConnEnv<'_>,
    ) -> Result<Action, GatewayError> {
        found.sort_by_key(|c| c.value_handle);
        for ch in &found {
            if let Some(characteristic) = Characteristic::from_uuid(&ch.uuid) {
                debug!(conn = %self.key, name = characteristic.label(), handle = %ch.value_handle, "characteristic");
                self.handles.set(characteristic, ch.value_handle);
            }
        }
        if !self.handles.uplink.is_valid() {
            return Err(GatewayError::protocol("uplink characteristic missing"));
        }
        if !self.handles.downlink.is_valid() {
            return Err(GatewayError::protocol("downlink characteristic missing"));
        }

        // Descriptors of the uplink sit between its value handle and the
        // declaration of the next characteristic.
        let uplink = self.handles.uplink;
        let start = uplink.next();
        let end = found
            .iter()
            .map(|c| c.value_handle)
            .find(|h| *h > uplink)
            .map(|h| AttrHandle(h.0.saturating_sub(2)))
            .unwrap_or(self.handles.service_end);
        if end < start {
            debug!(conn = %self.key, "no room for uplink descriptors, polling instead");
            return self.begin_cert_exchange(env);
        }
        self.phase = Phase::DiscoverDescriptors;
        Ok(Action::Gatt(GattRequest::Discover(
            DiscoverRequest::Descriptors { start, end },
        )))
    }

    fn begin_cert_exchange(&mut self, env: &ConnEnv<'_>) -> Result<Action, GatewayError> {
        if !self.handles.server_cert.is_valid() {
            warn!(
                conn = %self.key,
                addr = %self.addr,
                device_cert = self.handles.device_cert.is_valid(),
                "server certificate characteristic missing, skipping server certificate write"
            );
        } else if env.certs.is_provisioned() {
            self.cert.scratch = Some(BytesMut::new());
            self.assembler.reset();
            self.phase = Phase::ReadServerSerial;
            return Ok(read(self.handles.server_cert));
        } else {
            warn!(conn = %self.key, "no server certificate provisioned, skipping server certificate write");
        }
        self.begin_device_cert(env)
    }

    fn begin_server_write(&mut self, env: &ConnEnv<'_>) -> Result<Action, GatewayError> {
        let frame = env.limits.frame_capacity(self.mtu);
        let session = env.certs.start_session();
        debug!(conn = %self.key, version = session.version(), len = env.certs.len(), "writing server certificate");
        self.cert.server = Some(Packetizer::new(session, frame));
        self.phase = Phase::WriteServerCert;
        self.next_server_frame()
    }

    fn next_server_frame(&mut self) -> Result<Action, GatewayError> {
        let packetizer = self
            .cert
            .server
            .as_mut()
            .ok_or_else(|| GatewayError::protocol("server certificate session missing"))?;
        let packet = packetizer.get()?;
        if packet.is_empty() {
            return Err(GatewayError::protocol("server certificate source stalled"));
        }
        self.last_frame_sent = packet.is_last();
        Ok(write(self.handles.server_cert, packet.data))
    }

    fn on_server_serial(&mut self, data: &[u8], env: &ConnEnv<'_>) -> Result<Action, GatewayError> {
        if data.is_empty() && !self.assembler.is_started() {
            info!(conn = %self.key, "device holds no server certificate");
            self.cert.scratch = None;
            return self.begin_server_write(env);
        }
        let packet = self.assembler.accept(data)?;
        let scratch = self.cert.scratch.get_or_insert_with(BytesMut::new);
        if scratch.len() + packet.payload.len() > env.limits.server_cert_max_len {
            return Err(GatewayError::exhausted("server certificate serial too long"));
        }
        scratch.extend_from_slice(packet.payload);
        if !packet.is_last {
            return Ok(read(self.handles.server_cert));
        }

        let device_serial = self.cert.scratch.take().unwrap_or_default().freeze();
        let current = env.certs.serial();
        if !current.is_empty() && device_serial == current {
            info!(conn = %self.key, serial = %hex::encode(&current), "device server certificate is current");
            return self.begin_device_cert(env);
        }
        debug!(
            conn = %self.key,
            device = %hex::encode(&device_serial),
            current = %hex::encode(&current),
            "device server certificate is stale"
        );
        self.begin_server_write(env)
    }

    fn begin_device_cert(&mut self, env: &ConnEnv<'_>) -> Result<Action, GatewayError> {
        if !self.handles.device_cert.is_valid() {
            debug!(conn = %self.key, "no device certificate characteristic");
            return self.begin_uplink(env);
        }
        self.cert.device = Some(DeviceCertCollector::start(env.limits.device_cert_max_len));
        self.assembler.reset();
        self.phase = Phase::ReadDeviceCert;
        Ok(read(self.handles.device_cert))
    }

    fn on_device_cert(&mut self, data: &[u8], env: &ConnEnv<'_>) -> Result<Action, GatewayError> {
        if data.is_empty() && !self.assembler.is_started() {
            info!(conn = %self.key, "device has no certificate to submit");
            return self.begin_uplink(env);
        }
        let packet = self.assembler.accept(data)?;
        let collector = self
            .cert
            .device
            .as_mut()
            .ok_or_else(|| GatewayError::protocol("device certificate collector missing"))?;
        collector.push(packet.payload)?;
        if !packet.is_last {
            return Ok(read(self.handles.device_cert));
        }
        if let Some(collector) = self.cert.device.take() {
            let len = collector.finish(env.cloud)?;
            info!(conn = %self.key, len, "device certificate submitted");
            env.stats.record_device_cert();
        }
        self.begin_uplink(env)
    }

    fn begin_uplink(&mut self, env: &ConnEnv<'_>) -> Result<Action, GatewayError> {
        self.cert.cleanup();
        let stream = DownlinkStream::new(
            env.pool.clone(),
            self.key.owner_tag(),
            env.limits.block_alloc_timeout,
            self.waker.clone(),
        );
        let uplink = Uplink::open(env.cloud, &stream)?;
        self.uplink = Some(uplink);
        self.downlink = Some(Packetizer::new(stream, env.limits.frame_capacity(self.mtu)));
        self.assembler.reset();
        self.uplink_finished = false;

        if self.handles.uplink_ccc.is_valid() {
            self.phase = Phase::SubscribeUplink;
            return Ok(Action::Gatt(GattRequest::Subscribe {
                value_handle: self.handles.uplink,
                ccc_handle: self.handles.uplink_ccc,
            }));
        }
        self.phase = Phase::ReadUplink;
        Ok(read(self.handles.uplink))
    }

    fn on_subscribed(
        &mut self,
        result: Result<(), AttError>,
        env: &ConnEnv<'_>,
    ) -> Result<Action, GatewayError> {
        result.map_err(|err| att_failure("uplink subscribe", err))?;
        if self.phase != Phase::SubscribeUplink {
            return Err(GatewayError::protocol(format!(
                "subscribe completion in phase {:?}",
                self.phase
            )));
        }
        if self.uplink_finished {
            return self.begin_downlink(env);
        }
        self.phase = Phase::AwaitUplink;
        Ok(Action::Wait)
    }

    fn on_notification(
        &mut self,
        handle: AttrHandle,
        data: &[u8],
        env: &ConnEnv<'_>,
    ) -> Result<Action, GatewayError> {
        let listening = matches!(self.phase, Phase::SubscribeUplink | Phase::AwaitUplink);
        if handle != self.handles.uplink || !listening || self.uplink_finished {
            debug!(conn = %self.key, %handle, phase = ?self.phase, "notification ignored");
            return Ok(Action::Wait);
        }
        if !self.forward_uplink(data, env)? {
            return Ok(Action::Wait);
        }
        if self.pending.is_some() {
            self.uplink_finished = true;
            return Ok(Action::Wait);
        }
        self.begin_downlink(env)
    }

    fn on_read(
        &mut self,
        result: Result<Bytes, AttError>,
        env: &ConnEnv<'_>,
    ) -> Result<Action, GatewayError> {
        let data = result.map_err(|err| att_failure("read", err))?;
        match self.phase {
            Phase::ReadServerSerial => self.on_server_serial(&data, env),
            Phase::ReadDeviceCert => self.on_device_cert(&data, env),
            Phase::ReadUplink => {
                if self.forward_uplink(&data, env)? {
                    self.begin_downlink(env)
                } else {
                    Ok(read(self.handles.uplink))
                }
            }
            phase => Err(GatewayError::protocol(format!(
                "read completion in phase {phase:?}"
            ))),
        }
    }

    /// Forwards one uplink frame; returns whether it was the last one.
    fn forward_uplink(&mut self, frame: &[u8], env: &ConnEnv<'_>) -> Result<bool, GatewayError> {
        let packet = self.assembler.accept(frame)?;
        debug!(conn = %self.key, len = packet.payload.len(), frame = %hex::encode(frame), "uplink frame");
        let uplink = self
            .uplink
            .as_mut()
            .ok_or_else(|| GatewayError::protocol("uplink not open"))?;
        uplink.write(packet.payload, packet.is_last)?;
        env.stats.add_uplink_bytes(packet.payload.len());
        if packet.is_last {
            if let Some(uplink) = self.uplink.take() {
                info!(conn = %self.key, bytes = uplink.forwarded(), "uplink complete");
                uplink.close();
            }
        }
        Ok(packet.is_last)
    }

    fn on_written(
        &mut self,
        result: Result<(), AttError>,
        env: &ConnEnv<'_>,
    ) -> Result<Action, GatewayError> {
        result.map_err(|err| att_failure("write", err))?;
        match self.phase {
            Phase::WriteServerCert => {
                if !self.last_frame_sent {
                    return self.next_server_frame();
                }
                let session = self.cert.server.take().map(Packetizer::finish);
                if !session.as_ref().is_some_and(|s| s.is_newest()) {
                    let stale = GatewayError::StaleData("server certificate changed during write".into());
                    info!(conn = %self.key, "server certificate changed during write, restarting");
                    env.stats.record_failure(&stale);
                    return self.begin_server_write(env);
                }
                info!(conn = %self.key, "server certificate written");
                env.stats.record_server_cert_write();
                self.begin_device_cert(env)
            }
            Phase::WriteDownlink => {
                if self.last_frame_sent {
                    return Ok(self.finish_downlink(env));
                }
                self.next_downlink_frame(env)
            }
            phase => Err(GatewayError::protocol(format!(
                "write completion in phase {phase:?}"
            ))),
        }
    }

    fn begin_downlink(&mut self, env: &ConnEnv<'_>) -> Result<Action, GatewayError> {
        info!(conn = %self.key, "Starting downlink");
        self.next_downlink_frame(env)
    }

    fn next_downlink_frame(&mut self, env: &ConnEnv<'_>) -> Result<Action, GatewayError> {
        let packetizer = self
            .downlink
            .as_mut()
            .ok_or_else(|| GatewayError::protocol("downlink not open"))?;
        let packet = packetizer.get()?;
        if packet.is_empty() {
            debug!(conn = %self.key, "downlink waiting for cloud data");
            self.phase = Phase::AwaitDownlinkData;
            return Ok(Action::Wait);
        }
        trace!(conn = %self.key, frame = %hex::encode(&packet.data), "downlink frame");
        env.stats.add_downlink_bytes(packet.data.len() - 1);
        self.phase = Phase::WriteDownlink;
        self.last_frame_sent = packet.is_last();
        Ok(write(self.handles.downlink, packet.data))
    }

    fn finish_downlink(&mut self, env: &ConnEnv<'_>) -> Action {
        if let Some(packetizer) = self.downlink.take() {
            packetizer.finish().finish();
        }
        self.phase = Phase::Done;
        env.stats.record_completed();
        info!(conn = %self.key, addr = %self.addr, "downlink complete, disconnecting");
        Action::Disconnect(DisconnectReason::RemoteUserTerminated)
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        self.teardown();
    }
}
