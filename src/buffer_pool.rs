//! Lock-free buffer recycling for the datagram hot paths

use bytes::BytesMut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;

/// Lock-free buffer pool backed by crossbeam's ArrayQueue
pub struct BufferPool {
    pool: crossbeam_queue::ArrayQueue<BytesMut>,
    buffer_size: usize,
    hits: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_size: usize, buffer_size: usize) -> Self {
        Self {
            pool: crossbeam_queue::ArrayQueue::new(max_size),
            buffer_size,
            hits: AtomicUsize::new(0),
        }
    }

    /// Get a buffer from the pool, allocating when empty
    pub fn try_get(&self) -> BytesMut {
        match self.pool.pop() {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => BytesMut::with_capacity(self.buffer_size),
        }
    }

    /// Return a buffer to the pool, dropping odd-sized or surplus ones
    pub fn try_put(&self, mut buf: BytesMut) {
        if buf.capacity() >= self.buffer_size / 2 && buf.capacity() <= self.buffer_size * 2 {
            buf.clear();
            let _ = self.pool.push(buf);
        }
    }

    /// (hits, buffers currently pooled)
    pub fn stats(&self) -> (usize, usize) {
        (self.hits.load(Ordering::Relaxed), self.pool.len())
    }
}

static DATAGRAM_POOL: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(2000, 2048));

/// Get a datagram-sized buffer from the global pool
pub fn get_datagram_buffer() -> BytesMut {
    DATAGRAM_POOL.try_get()
}

/// Return a datagram buffer to the global pool
pub fn put_datagram_buffer(buf: BytesMut) {
    DATAGRAM_POOL.try_put(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_buffers() {
        let pool = BufferPool::new(4, 1024);
        let buf = pool.try_get();
        assert_eq!(pool.stats().0, 0);
        pool.try_put(buf);
        let _ = pool.try_get();
        assert_eq!(pool.stats().0, 1);
    }

    #[test]
    fn rejects_mismatched_capacity() {
        let pool = BufferPool::new(4, 1024);
        pool.try_put(BytesMut::with_capacity(16));
        assert_eq!(pool.stats().1, 0);
    }
}
