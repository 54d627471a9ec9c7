use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pouch_core::{GatewayError, GatewayLimits, OwnerTag};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("all {capacity} blocks in use")]
    Exhausted { capacity: usize },
    #[error("append of {len} bytes exceeds {remaining} bytes left in block")]
    Overflow { len: usize, remaining: usize },
}

impl From<PoolError> for GatewayError {
    fn from(err: PoolError) -> Self {
        GatewayError::exhausted(err.to_string())
    }
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    returned: Condvar,
    capacity: usize,
    block_size: usize,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of equally sized buffers handed out as `Block`s.
///
/// Every buffer is allocated up front; a `Block` owns its buffer until it
/// is dropped, at which point the buffer goes back on the free list.
#[derive(Debug, Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    pub fn new(capacity: usize, block_size: usize) -> Self {
        let free = (0..capacity).map(|_| Vec::with_capacity(block_size)).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                returned: Condvar::new(),
                capacity,
                block_size,
            }),
        }
    }

    pub fn from_limits(limits: &GatewayLimits) -> Self {
        Self::new(limits.max_blocks, limits.max_block_size)
    }

    /// Takes a free block, waiting up to `timeout` for one to be released.
    pub fn allocate(&self, owner: OwnerTag, timeout: Duration) -> Result<Block, PoolError> {
        let guard = self.inner.lock();
        let (mut free, _) = self
            .inner
            .returned
            .wait_timeout_while(guard, timeout, |free| free.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let buf = free.pop().ok_or(PoolError::Exhausted {
            capacity: self.inner.capacity,
        })?;
        Ok(Block {
            buf,
            last: false,
            owner,
            pool: self.inner.clone(),
        })
    }

    pub fn try_allocate(&self, owner: OwnerTag) -> Result<Block, PoolError> {
        self.allocate(owner, Duration::ZERO)
    }

    /// Returns a block to the pool. Dropping the block has the same effect.
    pub fn release(&self, block: Block) {
        drop(block);
    }

    pub fn available(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }
}

/// Pool-owned buffer holding part of a downlink transfer.
#[derive(Debug)]
pub struct Block {
    buf: Vec<u8>,
    last: bool,
    owner: OwnerTag,
    pool: Arc<PoolInner>,
}

impl Block {
    /// Appends `data`, refusing writes that would exceed the block size.
    pub fn append(&mut self, data: &[u8]) -> Result<(), PoolError> {
        let remaining = self.remaining();
        if data.len() > remaining {
            return Err(PoolError::Overflow {
                len: data.len(),
                remaining,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.pool.block_size - self.buf.len()
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    pub fn set_last(&mut self, last: bool) {
        self.last = last;
    }

    pub fn owner(&self) -> OwnerTag {
        self.owner
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        self.pool.lock().push(buf);
        self.pool.returned.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;

    const OWNER: OwnerTag = OwnerTag(7);

    #[test]
    fn append_is_bounded_by_block_size() {
        let pool = BlockPool::new(1, 4);
        let mut block = pool.try_allocate(OWNER).unwrap();
        block.append(b"ab").unwrap();
        assert_eq!(
            block.append(b"cde"),
            Err(PoolError::Overflow {
                len: 3,
                remaining: 2
            })
        );
        block.append(b"cd").unwrap();
        assert_eq!(block.data(), b"abcd");
        assert_eq!(block.owner(), OWNER);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = BlockPool::new(2, 8);
        let _a = pool.try_allocate(OWNER).unwrap();
        let _b = pool.try_allocate(OWNER).unwrap();

        let started = Instant::now();
        let err = pool.allocate(OWNER, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, PoolError::Exhausted { capacity: 2 });
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(GatewayError::from(err).class(), "exhausted");
    }

    #[test]
    fn blocked_allocation_wakes_on_release() {
        let pool = BlockPool::new(1, 8);
        let held = pool.try_allocate(OWNER).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.allocate(OWNER, Duration::from_secs(5)).map(|b| b.len()))
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(held);

        assert_eq!(waiter.join().unwrap(), Ok(0));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn released_blocks_come_back_empty() {
        let pool = BlockPool::new(1, 8);
        let mut block = pool.try_allocate(OWNER).unwrap();
        block.append(b"payload").unwrap();
        block.set_last(true);
        drop(block);

        let block = pool.try_allocate(OWNER).unwrap();
        assert!(block.is_empty());
        assert!(!block.is_last());
        assert_eq!(block.remaining(), 8);
    }
}
