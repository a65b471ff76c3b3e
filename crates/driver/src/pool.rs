//! Frame buffer allocation
//!
//! [`FramePool`] hands out [`FrameBuffer`]s against a fixed byte budget. Each
//! buffer carries a lease on the bytes it was allocated with; dropping the
//! buffer returns the lease, so a buffer can be released exactly once and a
//! leaked buffer shows up in [`PoolStats`].

use bytes::BytesMut;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

use crate::error::{DriverError, Result};

/// Default pool budget: room for a few hundred full-size Ethernet frames
pub const DEFAULT_POOL_BUDGET: usize = 4 * 1024 * 1024;

/// Allocator for frame and transfer buffers
pub trait BufferAllocator {
    /// Allocate an empty buffer able to hold `size` bytes
    fn allocate(&self, size: usize) -> Result<FrameBuffer>;

    /// Give a buffer back
    fn release(&self, buffer: FrameBuffer) {
        drop(buffer);
    }
}

struct PoolInner {
    budget: usize,
    in_use: AtomicUsize,
    allocations: AtomicU64,
    releases: AtomicU64,
}

/// Byte-budgeted buffer pool, cheap to clone and shareable between threads
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

/// Point-in-time pool accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub budget: usize,
    pub in_use: usize,
    pub allocations: u64,
    pub releases: u64,
}

impl PoolStats {
    /// Buffers allocated and not yet released
    pub fn outstanding(&self) -> u64 {
        self.allocations - self.releases
    }
}

impl FramePool {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                budget,
                in_use: AtomicUsize::new(0),
                allocations: AtomicU64::new(0),
                releases: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            budget: self.inner.budget,
            in_use: self.inner.in_use.load(Ordering::Acquire),
            allocations: self.inner.allocations.load(Ordering::Acquire),
            releases: self.inner.releases.load(Ordering::Acquire),
        }
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_BUDGET)
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool").field("stats", &self.stats()).finish()
    }
}

impl BufferAllocator for FramePool {
    fn allocate(&self, size: usize) -> Result<FrameBuffer> {
        let budget = self.inner.budget;
        self.inner
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                in_use.checked_add(size).filter(|total| *total <= budget)
            })
            .map_err(|in_use| DriverError::AllocationFailed {
                requested: size,
                available: budget.saturating_sub(in_use),
            })?;

        self.inner.allocations.fetch_add(1, Ordering::AcqRel);
        trace!("Allocated {} byte frame buffer", size);

        Ok(FrameBuffer {
            bytes: BytesMut::with_capacity(size),
            lease: Lease {
                pool: Arc::clone(&self.inner),
                size,
            },
        })
    }
}

struct Lease {
    pool: Arc<PoolInner>,
    size: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(self.size, Ordering::AcqRel);
        self.pool.releases.fetch_add(1, Ordering::AcqRel);
    }
}

/// A pool-backed byte buffer holding one frame or one transfer's payload
pub struct FrameBuffer {
    bytes: BytesMut,
    lease: Lease,
}

impl FrameBuffer {
    /// Bytes reserved from the pool for this buffer
    pub fn leased(&self) -> usize {
        self.lease.size
    }

    /// Append bytes, up to the leased size
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        let room = self.lease.size.saturating_sub(self.bytes.len());
        let take = data.len().min(room);
        self.bytes.extend_from_slice(&data[..take]);
    }

    /// Zero-fill to the full leased size, ready to be read into
    pub fn prepare_read(&mut self) {
        self.bytes.clear();
        self.bytes.resize(self.lease.size, 0);
    }

    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.bytes.len())
            .field("leased", &self.lease.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release_accounting() {
        let pool = FramePool::new(4096);

        let a = pool.allocate(1500).unwrap();
        let b = pool.allocate(1500).unwrap();
        assert_eq!(pool.stats().in_use, 3000);
        assert_eq!(pool.stats().outstanding(), 2);

        pool.release(a);
        drop(b);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.releases, 2);
    }

    #[test]
    fn test_budget_exhaustion_is_transient() {
        let pool = FramePool::new(2048);
        let held = pool.allocate(2000).unwrap();

        match pool.allocate(100) {
            Err(DriverError::AllocationFailed {
                requested,
                available,
            }) => {
                assert_eq!(requested, 100);
                assert_eq!(available, 48);
            }
            other => panic!("expected AllocationFailed, got {:?}", other),
        }

        drop(held);
        assert!(pool.allocate(100).is_ok());
    }

    #[test]
    fn test_extend_is_bounded_by_lease() {
        let pool = FramePool::new(1024);
        let mut buf = pool.allocate(4).unwrap();
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_prepare_read_fills_lease() {
        let pool = FramePool::new(1024);
        let mut buf = pool.allocate(512).unwrap();
        buf.extend_from_slice(&[0xaa; 10]);
        buf.prepare_read();
        assert_eq!(buf.len(), 512);
        assert!(buf.iter().all(|b| *b == 0));

        buf.truncate(64);
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_pool_shared_between_threads() {
        let pool = FramePool::new(64 * 1024);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.allocate(128).unwrap();
                        drop(buf);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.allocations, 400);
        assert_eq!(stats.releases, 400);
    }
}
