//! Lock-free pool of fixed-size copy buffers shared by every tunnel's data
//! pump. Initialised once at startup per the "global mutable state" design
//! note and passed down by reference — never re-initialised.

use crossbeam_queue::ArrayQueue;

pub const DEFAULT_BUF_SIZE: usize = 32 * 1024;

pub struct BufferPool {
    queue: ArrayQueue<Vec<u8>>,
    buf_size: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            buf_size,
        }
    }

    /// Pop a buffer from the pool, or allocate a fresh one if empty.
    pub fn acquire(&self) -> Vec<u8> {
        self.queue
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size])
    }

    /// Return a buffer to the pool. Dropped instead of pooled if the pool
    /// is at capacity.
    pub fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        buf.resize(self.buf_size, 0);
        let _ = self.queue.push(buf);
    }
}
