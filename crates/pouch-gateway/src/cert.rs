//! Server certificate distribution and device certificate collection.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::{Bytes, BytesMut};
use pouch_core::GatewayError;
use pouch_transport::cloud::{CloudError, CloudTransport, ServerCertificate};
use pouch_transport_ble::packetizer::{Fill, PacketSource, Packetizer, PacketizerError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertError {
    #[error("server certificate of {len} bytes exceeds {max} byte buffer")]
    TooLarge { len: usize, max: usize },
    #[error("certificate data of {len} bytes exceeds {max} byte limit")]
    CapacityExceeded { len: usize, max: usize },
    #[error("no server certificate provisioned")]
    NotProvisioned,
    #[error("cloud rejected certificate: {0}")]
    Cloud(#[from] CloudError),
}

impl From<CertError> for GatewayError {
    fn from(err: CertError) -> Self {
        match err {
            CertError::Cloud(inner) => inner.into(),
            other => GatewayError::exhausted(other.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct Current {
    der: Bytes,
    serial: Bytes,
}

#[derive(Debug)]
struct StoreInner {
    current: RwLock<Current>,
    len: AtomicUsize,
    version: AtomicU64,
    max_len: usize,
}

/// Process-wide server certificate with a monotonically increasing version.
///
/// Read sessions hold only the version they started from; freshness is a
/// lock-free compare of that snapshot against the current version.
#[derive(Debug, Clone)]
pub struct ServerCertStore {
    inner: Arc<StoreInner>,
}

impl ServerCertStore {
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                current: RwLock::new(Current::default()),
                len: AtomicUsize::new(0),
                version: AtomicU64::new(0),
                max_len,
            }),
        }
    }

    /// Installs a new certificate and bumps the version.
    ///
    /// Oversized certificates are rejected and leave the store untouched.
    pub fn update(&self, cert: &ServerCertificate) -> Result<u64, CertError> {
        if cert.der.len() > self.inner.max_len {
            return Err(CertError::TooLarge {
                len: cert.der.len(),
                max: self.inner.max_len,
            });
        }
        let version = {
            let mut current = self
                .inner
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            current.der = cert.der.clone();
            current.serial = cert.serial.clone();
            self.inner.len.store(cert.der.len(), Ordering::Release);
            self.inner.version.fetch_add(1, Ordering::AcqRel) + 1
        };
        let fingerprint = blake3::hash(&cert.der).to_hex();
        info!(
            version,
            len = cert.der.len(),
            serial = %hex::encode(&cert.serial),
            fingerprint = %&fingerprint[..16],
            "server certificate updated"
        );
        Ok(version)
    }

    /// Fetches the current certificate from the cloud and installs it.
    pub fn refresh(&self, cloud: &dyn CloudTransport) -> Result<u64, CertError> {
        let cert = cloud.fetch_server_certificate()?;
        self.update(&cert)
    }

    /// Installs a certificate shipped with the gateway.
    pub fn load_builtin(&self, der: impl Into<Bytes>, serial: impl Into<Bytes>) -> Result<u64, CertError> {
        self.update(&ServerCertificate {
            der: der.into(),
            serial: serial.into(),
        })
    }

    pub fn start_session(&self) -> ServerCertSession {
        ServerCertSession {
            store: self.clone(),
            version: self.version(),
            offset: 0,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        self.version() > 0
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn serial(&self) -> Bytes {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .serial
            .clone()
    }
}

/// Read cursor over the server certificate for one device.
#[derive(Debug)]
pub struct ServerCertSession {
    store: ServerCertStore,
    version: u64,
    offset: usize,
}

impl ServerCertSession {
    /// Copies the next bytes into `dst`; `None` once everything was read.
    pub fn get_data(&mut self, dst: &mut [u8]) -> Option<(usize, bool)> {
        let current = self
            .store
            .inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let total = current.der.len();
        if self.offset >= total {
            return None;
        }
        let n = (total - self.offset).min(dst.len());
        dst[..n].copy_from_slice(&current.der[self.offset..self.offset + n]);
        self.offset += n;
        Some((n, self.offset >= total))
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.store.len()
    }

    /// Whether no newer certificate was installed since the session started.
    pub fn is_newest(&self) -> bool {
        self.version == self.store.version()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl PacketSource for ServerCertSession {
    fn fill(&mut self, dst: &mut [u8]) -> Result<Fill, PacketizerError> {
        Ok(match self.get_data(dst) {
            Some((len, true)) => Fill::done(len),
            Some((len, false)) => Fill::more(len),
            None => Fill::done(0),
        })
    }
}

/// Bounded accumulator for a device certificate read over GATT.
#[derive(Debug)]
pub struct DeviceCertCollector {
    buf: Vec<u8>,
    max_len: usize,
}

impl DeviceCertCollector {
    pub fn start(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Result<(), CertError> {
        let len = self.buf.len() + data.len();
        if len > self.max_len {
            return Err(CertError::CapacityExceeded {
                len,
                max: self.max_len,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Submits the collected certificate to the cloud.
    pub fn finish(self, cloud: &dyn CloudTransport) -> Result<usize, CertError> {
        cloud.submit_device_certificate(&self.buf)?;
        Ok(self.buf.len())
    }

    pub fn abort(self) {
        debug!(len = self.buf.len(), "device certificate collection aborted");
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Per-connection certificate exchange resources.
#[derive(Debug, Default)]
pub struct CertExchange {
    /// Holds the serial the device reports for its server certificate.
    pub scratch: Option<BytesMut>,
    pub server: Option<Packetizer<ServerCertSession>>,
    pub device: Option<DeviceCertCollector>,
}

impl CertExchange {
    pub fn is_active(&self) -> bool {
        self.scratch.is_some() || self.server.is_some() || self.device.is_some()
    }

    /// Releases scratch, then any live session, then the packetizer.
    /// Safe to call any number of times.
    pub fn cleanup(&mut self) {
        if !self.is_active() {
            return;
        }
        self.scratch = None;
        if let Some(device) = self.device.take() {
            device.abort();
        }
        if let Some(packetizer) = self.server.take() {
            let session = packetizer.finish();
            debug!(offset = session.offset(), "server certificate session released");
        }
    }
}

impl Drop for CertExchange {
    fn drop(&mut self) {
        self.cleanup();
    }
}
