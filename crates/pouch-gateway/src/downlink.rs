//! Cloud-to-device stream backed by pool blocks.
//!
//! The connection owns a `DownlinkStream` and pulls bytes from it while the
//! cloud pushes blocks through the paired `DownlinkSink` from its own thread.
//! Both halves share one mutex-guarded queue; the queue itself is freed when
//! the last of them is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pouch_core::{GatewayError, OwnerTag};
use pouch_transport::cloud::{CloudError, DownlinkReceiver};
use pouch_transport_ble::packetizer::{Fill, PacketSource, PacketizerError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::block::{Block, BlockPool};

/// Wakes a writer parked on an empty downlink queue.
pub type DataAvailable = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkState {
    Streaming,
    Complete,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownlinkError {
    #[error("downlink already complete")]
    Complete,
    #[error("downlink aborted")]
    Aborted,
}

impl From<DownlinkError> for GatewayError {
    fn from(err: DownlinkError) -> Self {
        match err {
            DownlinkError::Aborted => GatewayError::cloud(err.to_string()),
            DownlinkError::Complete => GatewayError::protocol(err.to_string()),
        }
    }
}

/// Outcome of one `get_data` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Data { len: usize, is_last: bool },
    /// Queue is empty; not an error and not the end of the stream.
    NoDataYet,
}

struct Queue {
    blocks: VecDeque<Block>,
    current: Option<Block>,
    offset: usize,
    state: DownlinkState,
    closed: bool,
    last_enqueued: bool,
}

impl Queue {
    fn flush(&mut self) -> usize {
        let freed = self.blocks.len() + usize::from(self.current.is_some());
        self.blocks.clear();
        self.current = None;
        self.offset = 0;
        freed
    }
}

struct Shared {
    queue: Mutex<Queue>,
    pool: BlockPool,
    owner: OwnerTag,
    alloc_timeout: Duration,
    data_available: DataAvailable,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort(&self) -> usize {
        let mut queue = self.lock();
        queue.state = DownlinkState::Aborted;
        queue.flush()
    }
}

/// Connection-side half of a downlink transfer.
pub struct DownlinkStream {
    shared: Arc<Shared>,
}

impl DownlinkStream {
    pub fn new(
        pool: BlockPool,
        owner: OwnerTag,
        alloc_timeout: Duration,
        data_available: DataAvailable,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    blocks: VecDeque::new(),
                    current: None,
                    offset: 0,
                    state: DownlinkState::Streaming,
                    closed: false,
                    last_enqueued: false,
                }),
                pool,
                owner,
                alloc_timeout,
                data_available,
            }),
        }
    }

    /// Cloud-side handle feeding this stream.
    pub fn sink(&self) -> DownlinkSink {
        DownlinkSink {
            shared: self.shared.clone(),
        }
    }

    /// Copies up to `dst.len()` bytes, crossing block boundaries as needed.
    ///
    /// `is_last` is reported together with the final bytes of the block
    /// carrying the last-fragment flag, after which the stream is complete.
    pub fn get_data(&mut self, dst: &mut [u8]) -> Result<Pull, DownlinkError> {
        let mut guard = self.shared.lock();
        let queue = &mut *guard;
        match queue.state {
            DownlinkState::Complete => return Err(DownlinkError::Complete),
            DownlinkState::Aborted => return Err(DownlinkError::Aborted),
            DownlinkState::Streaming => {}
        }

        let mut written = 0;
        let mut is_last = false;
        while written < dst.len() {
            if queue.current.is_none() {
                queue.current = queue.blocks.pop_front();
                queue.offset = 0;
            }
            let Some(block) = queue.current.as_ref() else {
                break;
            };
            let n = (block.len() - queue.offset).min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&block.data()[queue.offset..queue.offset + n]);
            written += n;
            queue.offset += n;
            if queue.offset < block.len() {
                continue;
            }

            let block_last = block.is_last();
            queue.current = None;
            queue.offset = 0;
            if block_last {
                queue.state = DownlinkState::Complete;
                is_last = true;
                break;
            }
        }

        if written == 0 && !is_last {
            return Ok(Pull::NoDataYet);
        }
        Ok(Pull::Data {
            len: written,
            is_last,
        })
    }

    /// Marks the stream aborted and frees every queued block.
    ///
    /// Returns the number of blocks released.
    pub fn abort(&self) -> usize {
        let freed = self.shared.abort();
        debug!(freed, "downlink aborted");
        freed
    }

    /// Releases the connection's hold on the stream.
    pub fn finish(self) {}

    pub fn state(&self) -> DownlinkState {
        self.shared.lock().state
    }

    pub fn queued_blocks(&self) -> usize {
        let queue = self.shared.lock();
        queue.blocks.len() + usize::from(queue.current.is_some())
    }
}

impl Drop for DownlinkStream {
    fn drop(&mut self) {
        let mut queue = self.shared.lock();
        queue.closed = true;
        queue.flush();
    }
}

impl fmt::Debug for DownlinkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownlinkStream")
            .field("owner", &self.shared.owner)
            .field("state", &self.state())
            .finish()
    }
}

impl PacketSource for DownlinkStream {
    fn fill(&mut self, dst: &mut [u8]) -> Result<Fill, PacketizerError> {
        match self.get_data(dst) {
            Ok(Pull::Data { len, is_last: true }) => Ok(Fill::done(len)),
            Ok(Pull::Data { len, is_last: false }) => Ok(Fill::more(len)),
            Ok(Pull::NoDataYet) => Ok(Fill::not_ready()),
            Err(err) => Err(PacketizerError::Source(err.into())),
        }
    }
}

/// Cloud-side half of a downlink transfer.
#[derive(Clone)]
pub struct DownlinkSink {
    shared: Arc<Shared>,
}

impl DownlinkSink {
    /// Appends a filled block to the queue.
    ///
    /// Only one block per stream may carry the last-fragment flag; anything
    /// offered after it is refused and its block goes back to the pool.
    ///
    /// Wakes the writer when no block was current, since it may be parked
    /// waiting for data.
    pub fn enqueue_block(&self, block: Block) -> Result<(), DownlinkError> {
        let wake = {
            let mut queue = self.shared.lock();
            match queue.state {
                DownlinkState::Aborted => return Err(DownlinkError::Aborted),
                DownlinkState::Complete => return Err(DownlinkError::Complete),
                DownlinkState::Streaming if queue.closed => return Err(DownlinkError::Aborted),
                DownlinkState::Streaming if queue.last_enqueued => {
                    return Err(DownlinkError::Complete)
                }
                DownlinkState::Streaming => {}
            }
            let wake = queue.current.is_none();
            queue.last_enqueued = block.is_last();
            queue.blocks.push_back(block);
            wake
        };
        if wake {
            (self.shared.data_available)();
        }
        Ok(())
    }

    pub fn state(&self) -> DownlinkState {
        self.shared.lock().state
    }

    fn accepting(&self) -> bool {
        let queue = self.shared.lock();
        queue.state == DownlinkState::Streaming && !queue.closed && !queue.last_enqueued
    }
}

impl DownlinkReceiver for DownlinkSink {
    fn on_block(&self, data: &[u8], is_last: bool) -> Result<(), CloudError> {
        if !self.accepting() {
            return Err(CloudError::Nack);
        }
        let block_size = self.shared.pool.block_size().max(1);
        let chunks: Vec<&[u8]> = if data.is_empty() {
            if !is_last {
                return Ok(());
            }
            vec![data]
        } else {
            data.chunks(block_size).collect()
        };

        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut block = self
                .shared
                .pool
                .allocate(self.shared.owner, self.shared.alloc_timeout)
                .map_err(|err| {
                    warn!(%err, "downlink block allocation failed");
                    CloudError::NoMemory
                })?;
            block
                .append(chunk)
                .map_err(|_| CloudError::NoMemory)?;
            block.set_last(is_last && index + 1 == total);
            self.enqueue_block(block).map_err(|_| CloudError::Nack)?;
        }
        Ok(())
    }

    fn on_end(&self, status: Result<(), CloudError>) {
        let Err(err) = status else {
            return;
        };
        warn!(%err, "cloud ended downlink with failure");
        let idle = {
            let mut queue = self.shared.lock();
            if queue.state == DownlinkState::Complete {
                return;
            }
            let idle = queue.current.is_none();
            queue.state = DownlinkState::Aborted;
            queue.flush();
            idle
        };
        if idle {
            (self.shared.data_available)();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn stream_with(pool: &BlockPool) -> (DownlinkStream, Arc<AtomicUsize>) {
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = wakes.clone();
        let stream = DownlinkStream::new(
            pool.clone(),
            OwnerTag(1),
            Duration::from_millis(10),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (stream, wakes)
    }

    fn block(pool: &BlockPool, data: &[u8], last: bool) -> Block {
        let mut block = pool.try_allocate(OwnerTag(1)).unwrap();
        block.append(data).unwrap();
        block.set_last(last);
        block
    }

    #[test]
    fn reads_cross_block_boundaries() {
        let pool = BlockPool::new(4, 32);
        let (mut stream, _) = stream_with(&pool);
        let sink = stream.sink();
        sink.enqueue_block(block(&pool, &[1; 20], false)).unwrap();
        sink.enqueue_block(block(&pool, &[2; 20], false)).unwrap();
        sink.enqueue_block(block(&pool, &[3; 10], true)).unwrap();

        let mut seen = Vec::new();
        let mut lens = Vec::new();
        let mut buf = [0u8; 15];
        loop {
            match stream.get_data(&mut buf).unwrap() {
                Pull::Data { len, is_last } => {
                    lens.push(len);
                    seen.extend_from_slice(&buf[..len]);
                    if is_last {
                        break;
                    }
                }
                Pull::NoDataYet => panic!("queue drained before last block"),
            }
        }

        // Reads span block boundaries: the third read takes the tail of the
        // second block and the head of the last one.
        assert_eq!(lens, vec![15, 15, 15, 5]);
        let mut expected = vec![1; 20];
        expected.extend([2; 20]);
        expected.extend([3; 10]);
        assert_eq!(seen, expected);
        assert_eq!(stream.state(), DownlinkState::Complete);
        assert_eq!(stream.get_data(&mut buf), Err(DownlinkError::Complete));
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn empty_queue_reports_no_data_yet() {
        let pool = BlockPool::new(1, 8);
        let (mut stream, _) = stream_with(&pool);
        let mut buf = [0u8; 4];
        assert_eq!(stream.get_data(&mut buf), Ok(Pull::NoDataYet));
        assert_eq!(stream.state(), DownlinkState::Streaming);
    }

    #[test]
    fn enqueue_wakes_only_an_idle_writer() {
        let pool = BlockPool::new(3, 8);
        let (mut stream, wakes) = stream_with(&pool);
        let sink = stream.sink();

        sink.enqueue_block(block(&pool, b"abcd", false)).unwrap();
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        let mut buf = [0u8; 2];
        stream.get_data(&mut buf).unwrap();
        sink.enqueue_block(block(&pool, b"ef", false)).unwrap();
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_last_block_completes_without_bytes() {
        let pool = BlockPool::new(1, 8);
        let (mut stream, _) = stream_with(&pool);
        stream.sink().on_block(&[], true).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(
            stream.get_data(&mut buf),
            Ok(Pull::Data {
                len: 0,
                is_last: true
            })
        );
    }

    #[test]
    fn abort_frees_every_queued_block() {
        let pool = BlockPool::new(3, 8);
        let (mut stream, _) = stream_with(&pool);
        let sink = stream.sink();
        for _ in 0..3 {
            sink.enqueue_block(block(&pool, b"xy", false)).unwrap();
        }
        assert_eq!(pool.available(), 0);

        assert_eq!(stream.abort(), 3);
        assert_eq!(pool.available(), 3);
        let mut buf = [0u8; 4];
        assert_eq!(stream.get_data(&mut buf), Err(DownlinkError::Aborted));
        assert!(sink.enqueue_block(pool.try_allocate(OwnerTag(1)).unwrap()).is_err());
        stream.finish();
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn sink_splits_oversized_cloud_blocks() {
        let pool = BlockPool::new(4, 4);
        let (mut stream, _) = stream_with(&pool);
        stream.sink().on_block(b"0123456789", true).unwrap();
        assert_eq!(stream.queued_blocks(), 3);

        let mut buf = [0u8; 16];
        assert_eq!(
            stream.get_data(&mut buf),
            Ok(Pull::Data {
                len: 10,
                is_last: true
            })
        );
        assert_eq!(&buf[..10], b"0123456789");
    }

    #[test]
    fn cloud_failure_aborts_and_wakes_idle_writer() {
        let pool = BlockPool::new(2, 8);
        let (mut stream, wakes) = stream_with(&pool);
        let sink = stream.sink();
        sink.on_end(Err(CloudError::Timeout));

        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        assert_eq!(stream.state(), DownlinkState::Aborted);
        let mut buf = [0u8; 4];
        assert_eq!(stream.get_data(&mut buf), Err(DownlinkError::Aborted));
        assert_eq!(sink.on_block(b"late", true), Err(CloudError::Nack));
    }

    #[test]
    fn pool_exhaustion_surfaces_as_no_memory() {
        let pool = BlockPool::new(1, 4);
        let (stream, _) = stream_with(&pool);
        let sink = stream.sink();
        assert_eq!(sink.on_block(b"01234567", true), Err(CloudError::NoMemory));
    }

    #[test]
    fn dropping_the_stream_releases_blocks_held_by_the_sink() {
        let pool = BlockPool::new(2, 8);
        let (stream, _) = stream_with(&pool);
        let sink = stream.sink();
        sink.on_block(b"abc", false).unwrap();
        drop(stream);

        assert_eq!(pool.available(), 2);
        assert_eq!(sink.on_block(b"def", true), Err(CloudError::Nack));
    }

    #[test]
    fn blocks_after_the_last_fragment_are_refused() {
        let pool = BlockPool::new(4, 8);
        let (mut stream, _) = stream_with(&pool);
        let sink = stream.sink();
        sink.on_block(b"aa", true).unwrap();
        assert_eq!(sink.on_block(b"bb", true), Err(CloudError::Nack));
        assert_eq!(
            sink.enqueue_block(block(&pool, b"cc", false)),
            Err(DownlinkError::Complete)
        );
        assert_eq!(stream.queued_blocks(), 1);
        assert_eq!(pool.available(), 3);

        let mut buf = [0u8; 8];
        assert_eq!(
            stream.get_data(&mut buf),
            Ok(Pull::Data {
                len: 2,
                is_last: true
            })
        );
        assert_eq!(&buf[..2], b"aa");
        assert_eq!(stream.get_data(&mut buf), Err(DownlinkError::Complete));
        assert_eq!(pool.available(), 4);
    }
}
