//! Process-wide reusable I/O buffers.
//!
//! Hashing borrows 256 KiB buffers and whole-file crypto borrows 1 MiB buffers.
//! Buffers return to their pool when the guard drops.

use std::ops::{Deref, DerefMut};
use std::sync::{LazyLock, Mutex};

/// Upper bound on idle buffers kept per pool.
const MAX_IDLE: usize = 32;

/// Pool of 256 KiB buffers used by the hash engine.
pub static HASH_BUFFERS: LazyLock<BufferPool> =
    LazyLock::new(|| BufferPool::new(crate::HASH_BUFFER_SIZE));

/// Pool of 1 MiB buffers used by blob encryption.
pub static CRYPTO_BUFFERS: LazyLock<BufferPool> =
    LazyLock::new(|| BufferPool::new(crate::CRYPTO_BUFFER_SIZE));

/// A fixed-size buffer pool.
pub struct BufferPool {
    size: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create an empty pool handing out buffers of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Buffer length handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Borrow a zeroed buffer.
    pub fn get(&self) -> PooledBuffer<'_> {
        let buf = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuffer {
            pool: self,
            buf: Some(buf),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        buf.fill(0);
        if let Ok(mut idle) = self.idle.lock()
            && idle.len() < MAX_IDLE
        {
            idle.push(buf);
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// A buffer checked out of a [`BufferPool`].
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Option<Vec<u8>>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
