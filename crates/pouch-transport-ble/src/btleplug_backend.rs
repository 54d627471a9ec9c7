use std::collections::{BTreeSet, HashMap};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic as BtCharacteristic, Manager as _,
    Peripheral as _, ScanFilter, Service as BtService, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures_util::StreamExt;
use pouch_core::{AttrHandle, ConnHandle, DisconnectReason, PeerAddr};
use pouch_transport::radio::{
    AdvKind, AdvReport, AttError, DiscoverRequest, DiscoverResult, DiscoveredCharacteristic,
    DiscoveredDescriptor, DiscoveredService, EventSink, GattRequest, Radio, RadioEvent,
};
use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{CCC_UUID, SERVICE_UUIDS};

#[derive(Debug, Clone)]
pub struct BtleplugRadioConfig {
    /// How often an active scan is re-armed.
    pub scan_interval: Duration,
    pub connect_timeout: Duration,
    /// MTU reported on connect; btleplug does not expose the negotiated value.
    pub mtu: usize,
    pub command_queue_capacity: usize,
}

impl Default for BtleplugRadioConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(6),
            mtu: 247,
            command_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum BtleplugRadioError {
    #[error("bluetooth manager unavailable")]
    ManagerUnavailable,
    #[error("no bluetooth adapter found")]
    AdapterUnavailable,
    #[error("radio worker is not running")]
    WorkerFailed,
    #[error("radio command queue is full")]
    QueueFull,
}

#[derive(Debug)]
enum Command {
    StartScan,
    StopScan,
    Connect(PeerAddr),
    Disconnect(ConnHandle, DisconnectReason),
    Submit(ConnHandle, GattRequest),
}

/// `Radio` backed by the host Bluetooth stack through btleplug.
///
/// btleplug hides ATT handles, so each connection gets a synthesized
/// attribute table: every service takes one handle, every characteristic a
/// declaration and a value handle, plus a CCC handle when it can notify.
#[derive(Debug)]
pub struct BtleplugRadio {
    commands: tokio_mpsc::Sender<Command>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl BtleplugRadio {
    pub fn spawn(
        config: BtleplugRadioConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, BtleplugRadioError> {
        let (commands, command_rx) = tokio_mpsc::channel(config.command_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), BtleplugRadioError>>();

        let worker = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(_) => {
                    let _ = ready_tx.send(Err(BtleplugRadioError::WorkerFailed));
                    return;
                }
            };
            runtime.block_on(async move {
                let adapter = match open_adapter().await {
                    Ok(adapter) => adapter,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run_worker(config, adapter, command_rx, sink, shutdown_rx).await;
            });
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                shutdown_tx: Some(shutdown_tx),
                worker: Some(worker),
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => Err(BtleplugRadioError::WorkerFailed),
        }
    }

    fn send(&self, command: Command) -> Result<(), BtleplugRadioError> {
        self.commands.try_send(command).map_err(|err| match err {
            tokio_mpsc::error::TrySendError::Full(_) => BtleplugRadioError::QueueFull,
            tokio_mpsc::error::TrySendError::Closed(_) => BtleplugRadioError::WorkerFailed,
        })
    }
}

impl Radio for BtleplugRadio {
    type Error = BtleplugRadioError;

    fn start_scan(&mut self) -> Result<(), Self::Error> {
        self.send(Command::StartScan)
    }

    fn stop_scan(&mut self) -> Result<(), Self::Error> {
        self.send(Command::StopScan)
    }

    fn connect(&mut self, addr: &PeerAddr) -> Result<(), Self::Error> {
        self.send(Command::Connect(addr.clone()))
    }

    fn disconnect(
        &mut self,
        conn: ConnHandle,
        reason: DisconnectReason,
    ) -> Result<(), Self::Error> {
        self.send(Command::Disconnect(conn, reason))
    }

    fn submit(&mut self, conn: ConnHandle, request: GattRequest) -> Result<(), Self::Error> {
        self.send(Command::Submit(conn, request))
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

async fn open_adapter() -> Result<Adapter, BtleplugRadioError> {
    let manager = Manager::new()
        .await
        .map_err(|_| BtleplugRadioError::ManagerUnavailable)?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|_| BtleplugRadioError::AdapterUnavailable)?;
    adapters
        .into_iter()
        .next()
        .ok_or(BtleplugRadioError::AdapterUnavailable)
}

#[derive(Debug, Clone)]
struct TableChar {
    value_handle: AttrHandle,
    ccc_handle: Option<AttrHandle>,
    inner: BtCharacteristic,
}

#[derive(Debug, Clone)]
struct TableService {
    uuid: Uuid,
    handle: AttrHandle,
    end_handle: AttrHandle,
    chars: Vec<TableChar>,
}

#[derive(Debug, Clone, Default)]
struct GattTable {
    services: Vec<TableService>,
}

impl GattTable {
    fn build(services: &BTreeSet<BtService>) -> Self {
        let mut next: u16 = 1;
        let mut take = || {
            let handle = AttrHandle(next);
            next = next.saturating_add(1);
            handle
        };
        let mut table = GattTable::default();
        for service in services.iter().filter(|s| s.primary) {
            let handle = take();
            let mut chars = Vec::new();
            let mut end_handle = handle;
            for characteristic in &service.characteristics {
                let _declaration = take();
                let value_handle = take();
                end_handle = value_handle;
                let ccc_handle = characteristic
                    .properties
                    .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
                    .then(&mut take);
                if let Some(ccc) = ccc_handle {
                    end_handle = ccc;
                }
                chars.push(TableChar {
                    value_handle,
                    ccc_handle,
                    inner: characteristic.clone(),
                });
            }
            table.services.push(TableService {
                uuid: service.uuid,
                handle,
                end_handle,
                chars,
            });
        }
        table
    }

    fn chars(&self) -> impl Iterator<Item = &TableChar> {
        self.services.iter().flat_map(|s| s.chars.iter())
    }

    fn discover(&self, request: &DiscoverRequest) -> Result<DiscoverResult, AttError> {
        let in_range = |h: AttrHandle, start: AttrHandle, end: AttrHandle| h >= start && h <= end;
        let result = match request {
            DiscoverRequest::PrimaryService { uuid } => DiscoverResult::Services(
                self.services
                    .iter()
                    .filter(|s| s.uuid == *uuid)
                    .map(|s| DiscoveredService {
                        uuid: s.uuid,
                        handle: s.handle,
                        end_handle: s.end_handle,
                    })
                    .collect(),
            ),
            DiscoverRequest::Characteristics { start, end } => DiscoverResult::Characteristics(
                self.chars()
                    .filter(|c| in_range(c.value_handle, *start, *end))
                    .map(|c| DiscoveredCharacteristic {
                        uuid: c.inner.uuid,
                        value_handle: c.value_handle,
                    })
                    .collect(),
            ),
            DiscoverRequest::Descriptors { start, end } => DiscoverResult::Descriptors(
                self.chars()
                    .filter_map(|c| c.ccc_handle)
                    .filter(|h| in_range(*h, *start, *end))
                    .map(|handle| DiscoveredDescriptor {
                        uuid: CCC_UUID,
                        handle,
                    })
                    .collect(),
            ),
        };
        let empty = match &result {
            DiscoverResult::Services(v) => v.is_empty(),
            DiscoverResult::Characteristics(v) => v.is_empty(),
            DiscoverResult::Descriptors(v) => v.is_empty(),
        };
        if empty {
            Err(AttError::ATTRIBUTE_NOT_FOUND)
        } else {
            Ok(result)
        }
    }

    fn by_value(&self, handle: AttrHandle) -> Option<&TableChar> {
        self.chars().find(|c| c.value_handle == handle)
    }

    fn by_ccc(&self, handle: AttrHandle) -> Option<&TableChar> {
        self.chars().find(|c| c.ccc_handle == Some(handle))
    }

    fn value_handles(&self) -> HashMap<Uuid, AttrHandle> {
        self.chars()
            .map(|c| (c.inner.uuid, c.value_handle))
            .collect()
    }
}

struct Link {
    addr: PeerAddr,
    id: PeripheralId,
    peripheral: Peripheral,
    table: GattTable,
    notify_task: Option<tokio::task::JoinHandle<()>>,
}

type Links = Arc<Mutex<HashMap<ConnHandle, Link>>>;

fn lock(links: &Links) -> MutexGuard<'_, HashMap<ConnHandle, Link>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Worker {
    adapter: Adapter,
    config: BtleplugRadioConfig,
    sink: Arc<dyn EventSink>,
    links: Links,
    scanning: bool,
    next_conn: u16,
}

async fn run_worker(
    config: BtleplugRadioConfig,
    adapter: Adapter,
    mut commands: tokio_mpsc::Receiver<Command>,
    sink: Arc<dyn EventSink>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(err) => {
            warn!(%err, "btleplug event stream unavailable");
            return;
        }
    };
    let mut rescan = tokio::time::interval(config.scan_interval);
    let mut worker = Worker {
        adapter,
        config,
        sink,
        links: Arc::new(Mutex::new(HashMap::new())),
        scanning: false,
        next_conn: 0,
    };

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            Some(event) = events.next() => worker.handle_event(event).await,
            Some(command) = commands.recv() => worker.handle_command(command).await,
            _ = rescan.tick(), if worker.scanning => {
                let _ = worker.adapter.start_scan(ScanFilter::default()).await;
            }
            else => break,
        }
    }

    for (_, link) in lock(&worker.links).drain() {
        if let Some(task) = link.notify_task {
            task.abort();
        }
    }
    info!("btleplug radio worker stopped");
}

impl Worker {
    async fn handle_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::ServiceDataAdvertisement { id, service_data } if self.scanning => {
                if !service_data.keys().any(|uuid| SERVICE_UUIDS.contains(uuid)) {
                    return;
                }
                let rssi = match self.adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral
                        .properties()
                        .await
                        .ok()
                        .flatten()
                        .and_then(|p| p.rssi)
                        .unwrap_or(0),
                    Err(_) => 0,
                };
                self.sink.emit(RadioEvent::DeviceFound(AdvReport {
                    addr: PeerAddr::new(id.to_string()),
                    rssi: rssi.clamp(i16::from(i8::MIN), i16::from(i8::MAX)) as i8,
                    kind: AdvKind::ConnectableUndirected,
                    service_data: service_data
                        .into_iter()
                        .map(|(uuid, data)| (uuid, Bytes::from(data)))
                        .collect(),
                }));
            }
            CentralEvent::DeviceDisconnected(id) => {
                let dropped = {
                    let mut links = lock(&self.links);
                    let conn = links.iter().find(|(_, l)| l.id == id).map(|(c, _)| *c);
                    conn.and_then(|c| links.remove(&c).map(|l| (c, l)))
                };
                if let Some((conn, link)) = dropped {
                    if let Some(task) = link.notify_task {
                        task.abort();
                    }
                    info!(%conn, addr = %link.addr, "peripheral dropped the link");
                    self.sink.emit(RadioEvent::Disconnected {
                        conn,
                        reason: DisconnectReason::ConnectionTimeout,
                    });
                }
            }
            _ => {}
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan => match self.adapter.start_scan(ScanFilter::default()).await {
                Ok(()) => self.scanning = true,
                Err(err) => warn!(%err, "scan start failed"),
            },
            Command::StopScan => {
                self.scanning = false;
                if let Err(err) = self.adapter.stop_scan().await {
                    warn!(%err, "scan stop failed");
                }
            }
            Command::Connect(addr) => {
                let conn = ConnHandle(self.next_conn);
                self.next_conn = self.next_conn.wrapping_add(1);
                tokio::spawn(connect_peer(
                    self.adapter.clone(),
                    self.config.clone(),
                    self.sink.clone(),
                    self.links.clone(),
                    conn,
                    addr,
                ));
            }
            Command::Disconnect(conn, reason) => {
                let Some(link) = lock(&self.links).remove(&conn) else {
                    debug!(%conn, "disconnect for unknown link");
                    return;
                };
                if let Some(task) = link.notify_task {
                    task.abort();
                }
                let sink = self.sink.clone();
                tokio::spawn(async move {
                    if let Err(err) = link.peripheral.disconnect().await {
                        warn!(%conn, %err, "disconnect failed");
                    }
                    sink.emit(RadioEvent::Disconnected { conn, reason });
                });
            }
            Command::Submit(conn, request) => self.submit(conn, request),
        }
    }

    fn submit(&self, conn: ConnHandle, request: GattRequest) {
        let (peripheral, table) = match lock(&self.links).get(&conn) {
            Some(link) => (link.peripheral.clone(), link.table.clone()),
            None => {
                debug!(%conn, "request for unknown link dropped");
                return;
            }
        };
        let sink = self.sink.clone();

        match request {
            GattRequest::Discover(request) => {
                sink.emit(RadioEvent::Discovered {
                    conn,
                    result: table.discover(&request),
                });
            }
            GattRequest::Read { handle } => {
                let target = table.by_value(handle).map(|c| c.inner.clone());
                tokio::spawn(async move {
                    let result = match target {
                        Some(ch) => peripheral
                            .read(&ch)
                            .await
                            .map(Bytes::from)
                            .map_err(|_| AttError::UNLIKELY),
                        None => Err(AttError::ATTRIBUTE_NOT_FOUND),
                    };
                    sink.emit(RadioEvent::ReadComplete { conn, result });
                });
            }
            GattRequest::Write { handle, data } => {
                let value = table.by_value(handle).map(|c| c.inner.clone());
                let ccc = table.by_ccc(handle).map(|c| c.inner.clone());
                tokio::spawn(async move {
                    let result = match (value, ccc) {
                        (Some(ch), _) => peripheral
                            .write(&ch, &data, WriteType::WithResponse)
                            .await
                            .map_err(|_| AttError::UNLIKELY),
                        (None, Some(ch)) if data.first().copied().unwrap_or(0) != 0 => {
                            peripheral.subscribe(&ch).await.map_err(|_| AttError::UNLIKELY)
                        }
                        (None, Some(ch)) => peripheral
                            .unsubscribe(&ch)
                            .await
                            .map_err(|_| AttError::UNLIKELY),
                        (None, None) => Err(AttError::ATTRIBUTE_NOT_FOUND),
                    };
                    sink.emit(RadioEvent::WriteComplete { conn, result });
                });
            }
            GattRequest::Subscribe { value_handle, .. } => {
                let target = table.by_value(value_handle).map(|c| c.inner.clone());
                tokio::spawn(async move {
                    let result = match target {
                        Some(ch) => peripheral.subscribe(&ch).await.map_err(|_| AttError::UNLIKELY),
                        None => Err(AttError::ATTRIBUTE_NOT_FOUND),
                    };
                    sink.emit(RadioEvent::SubscribeComplete { conn, result });
                });
            }
        }
    }
}

async fn connect_peer(
    adapter: Adapter,
    config: BtleplugRadioConfig,
    sink: Arc<dyn EventSink>,
    links: Links,
    conn: ConnHandle,
    addr: PeerAddr,
) {
    let failed = |reason| RadioEvent::ConnectFailed {
        addr: addr.clone(),
        reason,
    };

    let peripheral = match adapter.peripherals().await {
        Ok(peripherals) => peripherals
            .into_iter()
            .find(|p| p.id().to_string() == addr.as_str()),
        Err(_) => None,
    };
    let Some(peripheral) = peripheral else {
        warn!(%addr, "connect target not known to the adapter");
        sink.emit(failed(DisconnectReason::Other(0x02)));
        return;
    };

    match tokio::time::timeout(config.connect_timeout, peripheral.connect()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(%addr, %err, "connect failed");
            sink.emit(failed(DisconnectReason::Other(0x3e)));
            return;
        }
        Err(_) => {
            warn!(%addr, "connect timed out");
            sink.emit(failed(DisconnectReason::ConnectionTimeout));
            return;
        }
    }
    if let Err(err) = peripheral.discover_services().await {
        warn!(%addr, %err, "service discovery failed");
        let _ = peripheral.disconnect().await;
        sink.emit(failed(DisconnectReason::Other(0x3e)));
        return;
    }

    let table = GattTable::build(&peripheral.services());
    let handles = table.value_handles();
    let notify_sink = sink.clone();
    let notify_peripheral = peripheral.clone();
    let notify_task = tokio::spawn(async move {
        let Ok(mut notifications) = notify_peripheral.notifications().await else {
            return;
        };
        while let Some(n) = notifications.next().await {
            if let Some(handle) = handles.get(&n.uuid) {
                notify_sink.emit(RadioEvent::Notification {
                    conn,
                    handle: *handle,
                    data: Bytes::from(n.value),
                });
            }
        }
    });

    lock(&links).insert(
        conn,
        Link {
            addr: addr.clone(),
            id: peripheral.id(),
            peripheral,
            table,
            notify_task: Some(notify_task),
        },
    );
    info!(%conn, %addr, "connected");
    sink.emit(RadioEvent::Connected {
        conn,
        addr,
        mtu: config.mtu,
    });
}
