//! Shared request buffer pool.
//!
//! Each connection checks out one small read buffer for the lifetime of its
//! request. Buffers are recycled through a bounded free list instead of being
//! allocated per connection. The pool never blocks: an empty pool allocates,
//! a full pool drops.
//!
//! Memory held by idle buffers is bounded by `capacity * buffer_size`.

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bounded pool of reusable byte buffers, safe to share across tasks.
pub struct BufferPool {
    /// Idle buffers (LIFO for cache locality).
    free_list: Mutex<Vec<BytesMut>>,
    /// Maximum number of idle buffers retained.
    capacity: usize,
}

impl BufferPool {
    /// Create an empty pool that retains at most `capacity` idle buffers.
    ///
    /// Nothing is pre-allocated; buffers are created on first demand.
    pub fn new(capacity: usize) -> Self {
        Self {
            free_list: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take a buffer of exactly `size` bytes.
    ///
    /// Reuses an idle buffer when one with enough capacity is available.
    /// Idle buffers that are too small are discarded along the way. The
    /// contents of a reused buffer are not cleared.
    pub fn acquire(&self, size: usize) -> BytesMut {
        let reused = {
            let mut free_list = self.lock();
            std::iter::from_fn(|| free_list.pop()).find(|buf| buf.capacity() >= size)
        };

        match reused {
            Some(mut buf) => {
                // Only newly exposed bytes are written; old contents stay.
                buf.resize(size, 0);
                buf
            }
            None => BytesMut::zeroed(size),
        }
    }

    /// Return a buffer for reuse, or drop it if the pool is full.
    pub fn release(&self, buf: BytesMut) {
        let mut free_list = self.lock();
        if free_list.len() < self.capacity {
            free_list.push(buf);
        }
    }

    /// Check out a buffer that is released back to this pool on drop.
    pub fn checkout(self: &Arc<Self>, size: usize) -> PooledBuffer {
        PooledBuffer {
            buf: Some(self.acquire(size)),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no idle buffers are held.
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of idle buffers retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // The free list holds plain buffers, so a panic while it was locked
    // cannot leave it inconsistent.
    fn lock(&self) -> MutexGuard<'_, Vec<BytesMut>> {
        self.free_list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A buffer checked out from a [`BufferPool`].
///
/// Dereferences to the buffer's bytes and goes back to the pool when dropped.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_acquire_from_empty_pool() {
        let pool = BufferPool::new(4);
        assert!(pool.is_empty());

        let buf = pool.acquire(32);
        assert_eq!(buf.len(), 32);
        assert!(buf.capacity() >= 32);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_release_and_reuse() {
        let pool = BufferPool::new(4);

        let mut buf = pool.acquire(32);
        buf[0] = 42;
        let ptr = buf.as_ptr();
        pool.release(buf);
        assert_eq!(pool.len(), 1);

        let buf = pool.acquire(32);
        assert_eq!(buf.as_ptr(), ptr);
        assert_eq!(buf.len(), 32);
        // Reused contents are not zeroed
        assert_eq!(buf[0], 42);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_reuse_truncates_to_requested_size() {
        let pool = BufferPool::new(4);
        pool.release(pool.acquire(64));

        let buf = pool.acquire(16);
        assert_eq!(buf.len(), 16);
        assert!(buf.capacity() >= 64);
    }

    #[test]
    fn test_too_small_buffers_are_discarded() {
        let pool = BufferPool::new(4);
        let (a, b) = (pool.acquire(8), pool.acquire(8));
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.len(), 2);

        let buf = pool.acquire(32);
        assert_eq!(buf.len(), 32);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_release_beyond_capacity_drops() {
        let pool = BufferPool::new(2);
        let bufs: Vec<_> = (0..5).map(|_| pool.acquire(32)).collect();
        for buf in bufs {
            pool.release(buf);
        }
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_zero_capacity_pool_never_retains() {
        let pool = BufferPool::new(0);
        pool.release(pool.acquire(32));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_checkout_returns_on_drop() {
        let pool = Arc::new(BufferPool::new(4));
        {
            let mut buf = pool.checkout(32);
            assert_eq!(buf.len(), 32);
            buf[..4].copy_from_slice(b"PING");
            assert_eq!(&buf[..4], b"PING");
            assert!(pool.is_empty());
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_concurrent_checkouts_are_exclusive() {
        let pool = Arc::new(BufferPool::new(8));
        let handles: Vec<_> = (0..16u8)
            .map(|id| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut buf = pool.checkout(32);
                        buf.fill(id);
                        thread::yield_now();
                        assert!(buf.iter().all(|&b| b == id), "buffer shared across owners");
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.len() <= pool.capacity());
    }

    #[test]
    fn test_outstanding_buffers_are_distinct() {
        let pool = Arc::new(BufferPool::new(4));
        for _ in 0..4 {
            pool.release(pool.acquire(32));
        }

        let held: Vec<_> = (0..8).map(|_| pool.checkout(32)).collect();
        let ptrs: HashSet<_> = held.iter().map(|b| b.as_ptr()).collect();
        assert_eq!(ptrs.len(), held.len());

        drop(held);
        assert_eq!(pool.len(), 4);
    }
}
