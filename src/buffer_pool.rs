//! Buffer pool for reducing allocation overhead
//!
//! Reusable `BytesMut` buffers for per-connection read/write scratch space,
//! so short-lived connections don't pay an allocation on every accept.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// Capacity of a freshly allocated pooled buffer
const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Maximum number of buffers kept in the pool
const MAX_POOLED_BUFFERS: usize = 256;

/// Buffers that grew beyond this are dropped instead of pooled
const MAX_POOLED_BUFFER_SIZE: usize = 16384;

/// A pool of reusable BytesMut buffers
pub struct BufferPool {
    pool: ArrayQueue<BytesMut>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            pool: ArrayQueue::new(MAX_POOLED_BUFFERS),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Get a buffer from the pool, or allocate a new one if the pool is empty
    #[inline]
    pub fn get(&self) -> BytesMut {
        self.pool
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    /// Return a buffer to the pool for reuse. The buffer is cleared first;
    /// oversized buffers are dropped.
    #[inline]
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() <= MAX_POOLED_BUFFER_SIZE {
            buf.clear();
            // If the pool is full the buffer is simply dropped
            let _ = self.pool.push(buf);
        }
    }

    /// Number of buffers currently pooled
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Global buffer pool instance
static GLOBAL_POOL: std::sync::OnceLock<Arc<BufferPool>> = std::sync::OnceLock::new();

/// Get or initialize the global buffer pool
pub fn global_pool() -> &'static Arc<BufferPool> {
    GLOBAL_POOL.get_or_init(|| Arc::new(BufferPool::new()))
}

/// Get a buffer from the global pool
#[inline]
pub fn get_buffer() -> BytesMut {
    global_pool().get()
}

/// Return a buffer to the global pool
#[inline]
pub fn put_buffer(buf: BytesMut) {
    global_pool().put(buf);
}
