//! File-spool cloud collaborator.
//!
//! Stands in for a real cloud link on a standalone gateway: uplink data and
//! device certificates are written under the spool directory and downlink
//! payloads are picked up from it.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use pouch_transport::cloud::{
    CloudError, CloudSession, CloudTransport, DownlinkReceiver, ServerCertificate,
};
use tracing::{debug, info, warn};

const UPLINK_DIR: &str = "uplink";
const DEVICE_CERT_DIR: &str = "device-certs";
const DOWNLINK_DIR: &str = "downlink";
const NEXT_DOWNLINK: &str = "next.bin";
const SERVER_CERT: &str = "server-cert.der";
const SERVER_CERT_SERIAL: &str = "server-cert.serial";

fn io_error(context: &str, err: io::Error) -> CloudError {
    CloudError::Io(format!("{context}: {err}"))
}

#[derive(Debug)]
pub struct SpoolCloud {
    root: PathBuf,
    block_size: usize,
    next_id: AtomicU64,
}

impl SpoolCloud {
    /// Opens `root`, creating the spool layout if needed.
    pub fn open(root: impl Into<PathBuf>, block_size: usize) -> io::Result<Self> {
        let root = root.into();
        for dir in [UPLINK_DIR, DEVICE_CERT_DIR, DOWNLINK_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        info!(root = %root.display(), block_size, "spool cloud ready");
        Ok(Self {
            root,
            block_size: block_size.max(1),
            next_id: AtomicU64::new(1),
        })
    }

    fn session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl CloudTransport for SpoolCloud {
    fn fetch_server_certificate(&self) -> Result<ServerCertificate, CloudError> {
        let der = match fs::read(self.root.join(SERVER_CERT)) {
            Ok(der) => der,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CloudError::Rejected(404))
            }
            Err(err) => return Err(io_error("server certificate", err)),
        };
        let serial = match fs::read_to_string(self.root.join(SERVER_CERT_SERIAL)) {
            Ok(text) => hex::decode(text.trim())
                .map_err(|err| CloudError::Io(format!("server certificate serial: {err}")))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(io_error("server certificate serial", err)),
        };
        Ok(ServerCertificate {
            der: Bytes::from(der),
            serial: Bytes::from(serial),
        })
    }

    fn submit_device_certificate(&self, der: &[u8]) -> Result<(), CloudError> {
        let digest = blake3::hash(der).to_hex();
        let path = self
            .root
            .join(DEVICE_CERT_DIR)
            .join(format!("{}.der", &digest[..16]));
        fs::write(&path, der).map_err(|err| io_error("device certificate", err))?;
        info!(path = %path.display(), len = der.len(), "device certificate spooled");
        Ok(())
    }

    fn open_session(
        &self,
        downlink: Arc<dyn DownlinkReceiver>,
    ) -> Result<Box<dyn CloudSession>, CloudError> {
        let id = self.session_id();
        let dir = self.root.join(UPLINK_DIR);
        let part = dir.join(format!("{id:08}.part"));
        let file = File::create(&part).map_err(|err| io_error("uplink spool", err))?;
        debug!(session = id, path = %part.display(), "cloud session opened");
        Ok(Box::new(SpoolSession {
            id,
            file: Some(file),
            part,
            done: dir.join(format!("{id:08}.bin")),
            downlink_path: self.root.join(DOWNLINK_DIR).join(NEXT_DOWNLINK),
            block_size: self.block_size,
            downlink,
        }))
    }
}

struct SpoolSession {
    id: u64,
    file: Option<File>,
    part: PathBuf,
    done: PathBuf,
    downlink_path: PathBuf,
    block_size: usize,
    downlink: Arc<dyn DownlinkReceiver>,
}

impl SpoolSession {
    /// Takes the pending downlink payload; a missing file is an empty one.
    fn take_downlink(&self) -> Result<Vec<u8>, CloudError> {
        match fs::read(&self.downlink_path) {
            Ok(payload) => {
                fs::remove_file(&self.downlink_path)
                    .map_err(|err| io_error("downlink spool", err))?;
                Ok(payload)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(io_error("downlink spool", err)),
        }
    }

    /// Streams `payload` from a separate thread, since block allocation may
    /// wait on the gateway loop draining earlier blocks.
    fn serve_downlink(&self, payload: Vec<u8>) -> Result<(), CloudError> {
        let receiver = self.downlink.clone();
        let block_size = self.block_size;
        let id = self.id;
        thread::Builder::new()
            .name(format!("spool-downlink-{id}"))
            .spawn(move || {
                let status = push_blocks(receiver.as_ref(), &payload, block_size);
                match &status {
                    Ok(()) => debug!(session = id, len = payload.len(), "downlink served"),
                    Err(err) => warn!(session = id, %err, "downlink delivery failed"),
                }
                receiver.on_end(status);
            })
            .map_err(|err| io_error("downlink thread", err))?;
        Ok(())
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
    let mut chunks = payload.chunks(block_size).peekable();
    while let Some(chunk) = chunks.next() {
        receiver.on_block(chunk, chunks.peek().is_none())?;
    }
    Ok(())
}

impl CloudSession for SpoolSession {
    fn write_uplink(&mut self, data: &[u8], is_last: bool) -> Result<(), CloudError> {
        let Some(file) = self.file.as_mut() else {
            return Err(CloudError::Nack);
        };
        file.write_all(data)
            .map_err(|err| io_error("uplink spool", err))?;
        if !is_last {
            return Ok(());
        }

        if let Some(file) = self.file.take() {
            file.sync_all().map_err(|err| io_error("uplink spool", err))?;
        }
        fs::rename(&self.part, &self.done).map_err(|err| io_error("uplink spool", err))?;
        info!(session = self.id, path = %self.done.display(), "uplink spooled");
        let payload = self.take_downlink()?;
        self.serve_downlink(payload)
    }
}

impl Drop for SpoolSession {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            // Uplink never completed.
            if let Err(err) = fs::remove_file(&self.part) {
                warn!(session = self.id, %err, "failed to remove partial uplink");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        blocks: Mutex<Vec<(Vec<u8>, bool)>>,
        ended: Mutex<Option<mpsc::Sender<Result<(), CloudError>>>>,
    }

    impl DownlinkReceiver for Recorder {
        fn on_block(&self, data: &[u8], is_last: bool) -> Result<(), CloudError> {
            self.blocks.lock().unwrap().push((data.to_vec(), is_last));
            Ok(())
        }

        fn on_end(&self, status: Result<(), CloudError>) {
            if let Some(tx) = self.ended.lock().unwrap().take() {
                tx.send(status).unwrap();
            }
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::Receiver<Result<(), CloudError>>) {
        let (tx, rx) = mpsc::channel();
        let recorder = Recorder {
            ended: Mutex::new(Some(tx)),
            ..Recorder::default()
        };
        (Arc::new(recorder), rx)
    }

    #[test]
    fn uplink_is_finalized_and_downlink_served() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = SpoolCloud::open(dir.path(), 4).unwrap();
        fs::write(dir.path().join(DOWNLINK_DIR).join(NEXT_DOWNLINK), b"0123456789").unwrap();

        let (rx_side, ended) = recorder();
        let mut session = cloud.open_session(rx_side.clone()).unwrap();
        session.write_uplink(b"hello ", false).unwrap();
        session.write_uplink(b"world", true).unwrap();
        assert_eq!(session.write_uplink(b"!", true), Err(CloudError::Nack));

        ended
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        let uplink = fs::read(dir.path().join(UPLINK_DIR).join("00000001.bin")).unwrap();
        assert_eq!(uplink, b"hello world");
        assert!(!dir.path().join(DOWNLINK_DIR).join(NEXT_DOWNLINK).exists());
        assert_eq!(
            *rx_side.blocks.lock().unwrap(),
            vec![
                (b"0123".to_vec(), false),
                (b"4567".to_vec(), false),
                (b"89".to_vec(), true),
            ]
        );
    }

    #[test]
    fn missing_downlink_is_one_empty_last_block() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = SpoolCloud::open(dir.path(), 16).unwrap();
        let (rx_side, ended) = recorder();
        let mut session = cloud.open_session(rx_side.clone()).unwrap();
        session.write_uplink(b"x", true).unwrap();

        ended
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(*rx_side.blocks.lock().unwrap(), vec![(Vec::new(), true)]);
    }

    #[test]
    fn abandoned_session_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = SpoolCloud::open(dir.path(), 16).unwrap();
        let (rx_side, _ended) = recorder();
        let mut session = cloud.open_session(rx_side).unwrap();
        session.write_uplink(b"partial", false).unwrap();
        drop(session);

        let leftovers = fs::read_dir(dir.path().join(UPLINK_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn certificates_round_trip_through_spool() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = SpoolCloud::open(dir.path(), 16).unwrap();
        assert_eq!(
            cloud.fetch_server_certificate(),
            Err(CloudError::Rejected(404))
        );

        fs::write(dir.path().join(SERVER_CERT), [0x30, 0x82]).unwrap();
        fs::write(dir.path().join(SERVER_CERT_SERIAL), "beef\n").unwrap();
        let cert = cloud.fetch_server_certificate().unwrap();
        assert_eq!(cert.der, Bytes::from_static(&[0x30, 0x82]));
        assert_eq!(cert.serial, Bytes::from_static(&[0xbe, 0xef]));

        cloud.submit_device_certificate(b"device-cert").unwrap();
        let stored: Vec<_> = fs::read_dir(dir.path().join(DEVICE_CERT_DIR))
            .unwrap()
            .map(|entry| fs::read(entry.unwrap().path()).unwrap())
            .collect();
        assert_eq!(stored, vec![b"device-cert".to_vec()]);
    }
}
