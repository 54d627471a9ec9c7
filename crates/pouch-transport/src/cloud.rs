use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use pouch_core::GatewayError;
use thiserror::Error;
use tracing::debug;

/// Cloud collaborator failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    #[error("cloud client is not connected")]
    NotConnected,
    #[error("request rejected by cloud (status {0})")]
    Rejected(u16),
    #[error("request timed out")]
    Timeout,
    #[error("no memory for downlink block")]
    NoMemory,
    #[error("transfer was refused by the receiver")]
    Nack,
    #[error("cloud i/o error: {0}")]
    Io(String),
}

impl From<CloudError> for GatewayError {
    fn from(err: CloudError) -> Self {
        GatewayError::cloud(err.to_string())
    }
}

/// Current server certificate as issued by the cloud.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCertificate {
    /// DER-encoded certificate bytes handed to devices.
    pub der: Bytes,
    /// Serial identifying this certificate generation. Empty when unknown.
    pub serial: Bytes,
}

/// Receives cloud-to-device data pushed by the cloud transport.
///
/// The cloud calls these from its own execution context.
pub trait DownlinkReceiver: Send + Sync {
    /// One block of downlink payload, in order. An error refuses the block
    /// and should make the cloud end the transfer.
    fn on_block(&self, data: &[u8], is_last: bool) -> Result<(), CloudError>;
    /// End of transfer with its final status.
    fn on_end(&self, status: Result<(), CloudError>);
}

/// One bidirectional device session with the cloud.
pub trait CloudSession: Send {
    /// Forwards one uplink fragment; `is_last` closes the uplink direction.
    fn write_uplink(&mut self, data: &[u8], is_last: bool) -> Result<(), CloudError>;
}

/// Cloud transport contract used by the gateway core.
pub trait CloudTransport: Send + Sync {
    fn fetch_server_certificate(&self) -> Result<ServerCertificate, CloudError>;
    fn submit_device_certificate(&self, der: &[u8]) -> Result<(), CloudError>;
    /// Opens a session whose downlink data is delivered to `downlink`.
    fn open_session(
        &self,
        downlink: Arc<dyn DownlinkReceiver>,
    ) -> Result<Box<dyn CloudSession>, CloudError>;
}

/// Captured state of one `InMemoryCloud` session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub uplink: Vec<u8>,
    pub uplink_complete: bool,
    pub downlink_ended: Option<Result<(), CloudError>>,
}

#[derive(Default)]
struct CloudState {
    server_cert: Option<ServerCertificate>,
    device_certs: Vec<Vec<u8>>,
    sessions: Vec<SessionRecord>,
    receivers: Vec<Arc<dyn DownlinkReceiver>>,
    scripted_downlink: VecDeque<Vec<u8>>,
    downlink_block_size: usize,
    fail_open: bool,
    fail_uplink: bool,
    fail_device_cert: bool,
}

/// In-memory cloud for tests and simulations.
///
/// Downlink payloads queued with `script_downlink` are pushed, one per
/// session, as soon as that session's final uplink fragment arrives.
/// `push_downlink`/`end_downlink` drive a session by hand instead.
#[derive(Clone, Default)]
pub struct InMemoryCloud {
    state: Arc<Mutex<CloudState>>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::with_block_size(64)
    }

    /// Creates a cloud that splits scripted downlinks into `block_size` blocks.
    pub fn with_block_size(block_size: usize) -> Self {
        let cloud = Self::default();
        cloud.lock().downlink_block_size = block_size.max(1);
        cloud
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_server_certificate(&self, der: impl Into<Bytes>, serial: impl Into<Bytes>) {
        self.lock().server_cert = Some(ServerCertificate {
            der: der.into(),
            serial: serial.into(),
        });
    }

    /// Queues a downlink payload for the next session that completes its uplink.
    pub fn script_downlink(&self, payload: impl Into<Vec<u8>>) {
        self.lock().scripted_downlink.push_back(payload.into());
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub fn set_fail_uplink(&self, fail: bool) {
        self.lock().fail_uplink = fail;
    }

    pub fn set_fail_device_cert(&self, fail: bool) {
        self.lock().fail_device_cert = fail;
    }

    pub fn device_certificates(&self) -> Vec<Vec<u8>> {
        self.lock().device_certs.clone()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.lock().sessions.clone()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Pushes one block into session `index` by hand.
    pub fn push_downlink(
        &self,
        index: usize,
        data: &[u8],
        is_last: bool,
    ) -> Result<(), CloudError> {
        let receiver = self
            .lock()
            .receivers
            .get(index)
            .cloned()
            .ok_or(CloudError::NotConnected)?;
        receiver.on_block(data, is_last)
    }

    /// Ends the downlink transfer of session `index` with `status`.
    pub fn end_downlink(&self, index: usize, status: Result<(), CloudError>) {
        let receiver = {
            let mut state = self.lock();
            if let Some(record) = state.sessions.get_mut(index) {
                record.downlink_ended = Some(status.clone());
            }
            state.receivers.get(index).cloned()
        };
        if let Some(receiver) = receiver {
            receiver.on_end(status);
        }
    }

    fn deliver_scripted(&self, index: usize) {
        let (payload, receiver, block_size) = {
            let mut state = self.lock();
            let Some(payload) = state.scripted_downlink.pop_front() else {
                return;
            };
            let Some(receiver) = state.receivers.get(index).cloned() else {
                return;
            };
            (payload, receiver, state.downlink_block_size)
        };

        let status = push_blocks(receiver.as_ref(), &payload, block_size);
        debug!(session = index, len = payload.len(), ?status, "scripted downlink delivered");
        if let Some(record) = self.lock().sessions.get_mut(index) {
            record.downlink_ended = Some(status.clone());
        }
        receiver.on_end(status);
    }
}

fn push_blocks(
    receiver: &dyn DownlinkReceiver,
    payload: &[u8],
    block_size: usize,
) -> Result<(), CloudError> {
    if payload.is_empty() {
        return receiver.on_block(&[], true);
    }
    let total = payload.len().div_ceil(block_size);
    for (index, chunk) in payload.chunks(block_size).enumerate() {
        receiver.on_block(chunk, index + 1 == total)?;
    }
    Ok(())
}

struct InMemorySession {
    cloud: InMemoryCloud,
    index: usize,
}

impl CloudSession for InMemorySession {
    fn write_uplink(&mut self, data: &[u8], is_last: bool) -> Result<(), CloudError> {
        {
            let mut state = self.cloud.lock();
            if state.fail_uplink {
                return Err(CloudError::Rejected(500));
            }
            let record = state
                .sessions
                .get_mut(self.index)
                .ok_or(CloudError::NotConnected)?;
            if record.uplink_complete {
                return Err(CloudError::Nack);
            }
            record.uplink.extend_from_slice(data);
            record.uplink_complete = is_last;
        }
        if is_last {
            self.cloud.deliver_scripted(self.index);
        }
        Ok(())
    }
}

impl CloudTransport for InMemoryCloud {
    fn fetch_server_certificate(&self) -> Result<ServerCertificate, CloudError> {
        self.lock().server_cert.clone().ok_or(CloudError::Rejected(404))
    }

    fn submit_device_certificate(&self, der: &[u8]) -> Result<(), CloudError> {
        let mut state = self.lock();
        if state.fail_device_cert {
            return Err(CloudError::Rejected(400));
        }
        state.device_certs.push(der.to_vec());
        Ok(())
    }

    fn open_session(
        &self,
        downlink: Arc<dyn DownlinkReceiver>,
    ) -> Result<Box<dyn CloudSession>, CloudError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(CloudError::NotConnected);
        }
        state.sessions.push(SessionRecord::default());
        state.receivers.push(downlink);
        let index = state.sessions.len() - 1;
        Ok(Box::new(InMemorySession {
            cloud: self.clone(),
            index,
        }))
    }
}
