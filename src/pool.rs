//! Reusable byte buffers for the bundle codec.
//!
//! Writers borrow their entry buffer and readers their payload scratch space
//! from a `BufferPool`. The pool is an ordinary value shared through `Arc`;
//! each writer/reader gets a fresh one unless a pool is passed in.

use std::sync::Mutex;

/// Default number of idle buffers kept around.
pub const DEFAULT_MAX_BUFFERS: usize = 16;

#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_BUFFERS)
    }

    pub fn with_capacity(max_buffers: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_buffers,
        }
    }

    /// Take an empty buffer with at least `min_capacity` bytes reserved.
    pub fn take(&self, min_capacity: usize) -> Vec<u8> {
        let reused = self.buffers.lock().ok().and_then(|mut buffers| {
            // Prefer the smallest buffer that already fits.
            let idx = buffers
                .iter()
                .enumerate()
                .filter(|(_, b)| b.capacity() >= min_capacity)
                .min_by_key(|(_, b)| b.capacity())
                .map(|(i, _)| i)
                .or_else(|| buffers.len().checked_sub(1))?;
            Some(buffers.swap_remove(idx))
        });

        match reused {
            Some(mut buffer) => {
                buffer.clear();
                buffer.reserve(min_capacity);
                buffer
            }
            None => Vec::with_capacity(min_capacity),
        }
    }

    /// Hand a buffer back. Dropped if the pool is full.
    pub fn give(&self, buffer: Vec<u8>) {
        if buffer.capacity() == 0 {
            return;
        }
        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.max_buffers {
                buffers.push(buffer);
            }
        }
    }

    /// Number of idle buffers.
    pub fn pooled(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_reuses_returned_buffer() {
        let pool = BufferPool::new();
        let mut buf = pool.take(1024);
        buf.extend_from_slice(b"leftover");
        let cap = buf.capacity();
        pool.give(buf);
        assert_eq!(pool.pooled(), 1);

        let again = pool.take(16);
        assert!(again.is_empty());
        assert_eq!(again.capacity(), cap);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_capacity_limit() {
        let pool = BufferPool::with_capacity(2);
        for _ in 0..5 {
            pool.give(Vec::with_capacity(8));
        }
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn test_isolated_instances() {
        let a = BufferPool::new();
        let b = BufferPool::new();
        a.give(Vec::with_capacity(8));
        assert_eq!(a.pooled(), 1);
        assert_eq!(b.pooled(), 0);
    }

    #[test]
    fn test_empty_buffers_not_pooled() {
        let pool = BufferPool::new();
        pool.give(Vec::new());
        assert_eq!(pool.pooled(), 0);
    }
}
