//! Gateway event loop: scanning, connection bookkeeping and dispatch.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;

use pouch_core::{ConnHandle, ConnKey, DisconnectReason, GatewayError, GatewayLimits, PeerAddr};
use pouch_transport::cloud::CloudTransport;
use pouch_transport::radio::{AdvReport, EventSink, Radio, RadioEvent};
use tracing::{debug, info, trace, warn};

use crate::block::BlockPool;
use crate::cert::ServerCertStore;
use crate::config::GatewayConfig;
use crate::connection::{Action, ConnEnv, ConnEvent, NodeConnection, Phase};
use crate::scan::{ScanDecision, ScanPolicy};
use crate::stats::GatewayStats;
use crate::table::ConnectionTable;

/// Everything the gateway loop reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Radio(RadioEvent),
    DownlinkReady(ConnKey),
    Shutdown,
}

/// Cloneable handle posting events into the gateway loop.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<GatewayEvent>,
}

impl EventSender {
    pub fn send(&self, event: GatewayEvent) {
        if self.tx.send(event).is_err() {
            trace!("gateway loop gone, event dropped");
        }
    }

    pub fn downlink_ready(&self, key: ConnKey) {
        self.send(GatewayEvent::DownlinkReady(key));
    }

    pub fn shutdown(&self) {
        self.send(GatewayEvent::Shutdown);
    }
}

impl EventSink for EventSender {
    fn emit(&self, event: RadioEvent) {
        self.send(GatewayEvent::Radio(event));
    }
}

pub fn event_channel() -> (EventSender, Receiver<GatewayEvent>) {
    let (tx, rx) = mpsc::channel();
    (EventSender { tx }, rx)
}

fn conn_event(event: RadioEvent) -> Option<(ConnHandle, ConnEvent)> {
    let mapped = match event {
        RadioEvent::MtuUpdated { conn, mtu } => (conn, ConnEvent::MtuUpdated(mtu)),
        RadioEvent::Discovered { conn, result } => (conn, ConnEvent::Discovered(result)),
        RadioEvent::ReadComplete { conn, result } => (conn, ConnEvent::ReadComplete(result)),
        RadioEvent::WriteComplete { conn, result } => (conn, ConnEvent::WriteComplete(result)),
        RadioEvent::SubscribeComplete { conn, result } => {
            (conn, ConnEvent::SubscribeComplete(result))
        }
        RadioEvent::Notification { conn, handle, data } => {
            (conn, ConnEvent::Notification { handle, data })
        }
        RadioEvent::DeviceFound(_)
        | RadioEvent::Connected { .. }
        | RadioEvent::ConnectFailed { .. }
        | RadioEvent::Disconnected { .. } => return None,
    };
    Some(mapped)
}

/// Central-role gateway driving Pouch exchanges over a `Radio`.
pub struct Gateway<R: Radio> {
    radio: R,
    cloud: Arc<dyn CloudTransport>,
    pool: BlockPool,
    certs: ServerCertStore,
    limits: GatewayLimits,
    policy: ScanPolicy,
    table: ConnectionTable<NodeConnection>,
    connecting: Option<PeerAddr>,
    scanning: bool,
    running: bool,
    events: EventSender,
    stats: Arc<GatewayStats>,
}

impl<R: Radio> Gateway<R> {
    pub fn new(
        radio: R,
        cloud: Arc<dyn CloudTransport>,
        certs: ServerCertStore,
        config: GatewayConfig,
        events: EventSender,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let GatewayConfig {
            limits,
            allowlist,
            protocol_version,
        } = config;
        Ok(Self {
            radio,
            cloud,
            pool: BlockPool::from_limits(&limits),
            certs,
            policy: ScanPolicy::new(protocol_version, allowlist),
            table: ConnectionTable::new(limits.max_connections),
            limits,
            connecting: None,
            scanning: false,
            running: false,
            events,
            stats: Arc::new(GatewayStats::default()),
        })
    }

    /// Begins scanning for devices requesting a sync.
    pub fn start(&mut self) -> Result<(), GatewayError> {
        self.running = true;
        self.radio
            .start_scan()
            .map_err(|err| GatewayError::transport(format!("scan start failed: {err}")))?;
        self.scanning = true;
        info!(
            max_connections = self.table.capacity(),
            blocks = self.pool.capacity(),
            block_size = self.pool.block_size(),
            "gateway started"
        );
        Ok(())
    }

    /// Handles one event; returns `false` once the gateway has shut down.
    pub fn handle(&mut self, event: GatewayEvent) -> bool {
        match event {
            GatewayEvent::Radio(event) => self.on_radio(event),
            GatewayEvent::DownlinkReady(key) => {
                if self.table.get(key).is_none() {
                    debug!(conn = %key, "downlink wakeup for closed connection dropped");
                    return self.running;
                }
                self.dispatch(key, ConnEvent::DownlinkReady);
            }
            GatewayEvent::Shutdown => self.shutdown(),
        }
        self.running
    }

    /// Blocks on `events` until shutdown or until every sender is gone.
    pub fn run(&mut self, events: &Receiver<GatewayEvent>) {
        while let Ok(event) = events.recv() {
            if !self.handle(event) {
                return;
            }
        }
        debug!("event channel closed");
        self.shutdown();
    }

    /// Handles every queued event without blocking; returns how many ran.
    pub fn run_pending(&mut self, events: &Receiver<GatewayEvent>) -> usize {
        let mut handled = 0;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    handled += 1;
                    if !self.handle(event) {
                        return handled;
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return handled,
            }
        }
    }

    pub fn stats(&self) -> Arc<GatewayStats> {
        self.stats.clone()
    }

    pub fn certs(&self) -> &ServerCertStore {
        &self.certs
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    pub fn phase(&self, conn: ConnHandle) -> Option<Phase> {
        let key = self.table.key_for(conn)?;
        self.table.get(key).map(NodeConnection::phase)
    }

    fn on_radio(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::DeviceFound(report) => self.on_device_found(report),
            RadioEvent::Connected { conn, addr, mtu } => self.on_connected(conn, addr, mtu),
            RadioEvent::ConnectFailed { addr, reason } => {
                warn!(%addr, %reason, "connection attempt failed");
                self.stats.record_connect_failure();
                if self.connecting.as_ref() == Some(&addr) {
                    self.connecting = None;
                }
                self.resume_scan();
            }
            RadioEvent::Disconnected { conn, reason } => self.on_disconnected(conn, reason),
            other => {
                let Some((conn, event)) = conn_event(other) else {
                    return;
                };
                let Some(key) = self.table.key_for(conn) else {
                    debug!(%conn, "event for unknown connection dropped");
                    return;
                };
                self.dispatch(key, event);
            }
        }
    }

    fn on_device_found(&mut self, report: AdvReport) {
        if !self.running || self.connecting.is_some() || self.table.is_full() {
            return;
        }
        let already_connected = self.table.keys().into_iter().any(|key| {
            self.table
                .get(key)
                .is_some_and(|connection| connection.addr() == &report.addr)
        });
        if already_connected {
            return;
        }

        let adv = match self.policy.evaluate(&report) {
            ScanDecision::Connect(adv) => adv,
            ScanDecision::Ignore(reason) => {
                trace!(addr = %report.addr, ?reason, "advertisement ignored");
                return;
            }
        };
        info!(
            addr = %report.addr,
            rssi = report.rssi,
            version = adv.self_version(),
            "connecting to pouch device"
        );
        self.pause_scan();
        match self.radio.connect(&report.addr) {
            Ok(()) => self.connecting = Some(report.addr),
            Err(err) => {
                warn!(addr = %report.addr, %err, "connect request failed");
                self.stats.record_connect_failure();
                self.resume_scan();
            }
        }
    }

    fn on_connected(&mut self, conn: ConnHandle, addr: PeerAddr, mtu: usize) {
        if self.connecting.as_ref() == Some(&addr) {
            self.connecting = None;
        }
        let mtu = if mtu == 0 { self.limits.default_mtu } else { mtu };
        let events = self.events.clone();
        let inserted = self.table.insert(conn, |key| {
            NodeConnection::new(
                key,
                conn,
                addr.clone(),
                mtu,
                Arc::new(move || events.downlink_ready(key)),
            )
        });
        match inserted {
            Ok(key) => {
                info!(conn = %key, %addr, mtu, "device connected");
                self.stats.record_connection();
                self.dispatch(key, ConnEvent::Start);
            }
            Err(err) => {
                warn!(%conn, %addr, %err, "no connection slot, disconnecting");
                if let Err(err) = self
                    .radio
                    .disconnect(conn, DisconnectReason::RemoteUserTerminated)
                {
                    warn!(%conn, %err, "disconnect request failed");
                }
            }
        }
        self.resume_scan();
    }

    fn on_disconnected(&mut self, conn: ConnHandle, reason: DisconnectReason) {
        let Some(key) = self.table.key_for(conn) else {
            debug!(%conn, %reason, "disconnect for unknown connection");
            return;
        };
        if let Some(mut connection) = self.table.remove(key) {
            info!(conn = %key, addr = %connection.addr(), %reason, "device disconnected");
            connection.on_disconnected(reason, &self.stats);
        }
        self.resume_scan();
    }

    /// Feeds `event` to one connection and carries out the resulting action.
    fn dispatch(&mut self, key: ConnKey, event: ConnEvent) {
        let env = ConnEnv {
            cloud: self.cloud.as_ref(),
            pool: &self.pool,
            certs: &self.certs,
            limits: &self.limits,
            stats: self.stats.as_ref(),
        };
        let Some(connection) = self.table.get_mut(key) else {
            debug!(conn = %key, "event for closed connection dropped");
            return;
        };
        let conn = connection.conn();
        let mut action = connection.on_event(event, &env);
        let link_lost = loop {
            match action {
                Action::Wait => break false,
                Action::Gatt(request) => match self.radio.submit(conn, request) {
                    Ok(()) => break false,
                    Err(err) => action = connection.on_submit_failed(&err.to_string(), &env),
                },
                Action::Disconnect(reason) => match self.radio.disconnect(conn, reason) {
                    Ok(()) => break false,
                    Err(err) => {
                        warn!(conn = %key, %err, "disconnect request failed, dropping connection");
                        break true;
                    }
                },
            }
        };
        if link_lost {
            self.table.remove(key);
            self.resume_scan();
        }
    }

    fn pause_scan(&mut self) {
        if !self.scanning {
            return;
        }
        if let Err(err) = self.radio.stop_scan() {
            warn!(%err, "scan stop failed");
        }
        self.scanning = false;
    }

    fn resume_scan(&mut self) {
        if !self.running || self.scanning || self.connecting.is_some() || self.table.is_full() {
            return;
        }
        match self.radio.start_scan() {
            Ok(()) => self.scanning = true,
            Err(err) => warn!(%err, "scan restart failed"),
        }
    }

    fn shutdown(&mut self) {
        if !self.running && self.table.is_empty() {
            return;
        }
        info!(connections = self.table.len(), "gateway shutting down");
        self.running = false;
        self.pause_scan();
        for key in self.table.keys() {
            if let Some(connection) = self.table.remove(key) {
                if let Err(err) = self
                    .radio
                    .disconnect(connection.conn(), DisconnectReason::LocalHostTerminated)
                {
                    warn!(conn = %key, %err, "disconnect request failed");
                }
            }
        }
        self.connecting = None;
    }
}
