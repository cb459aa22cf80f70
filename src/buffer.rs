use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A thread-safe pool of reusable read buffers.
///
/// Selector threads check a buffer out for each read, fill it from the
/// socket, and return it when the bytes have been copied into the owning
/// connection's accumulation buffer. The pool is capped at its initial
/// capacity; buffers returned beyond that are simply dropped, so a burst of
/// connections cannot pin memory forever.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<VecDeque<Vec<u8>>>>,
    buf_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool holding `capacity` buffers of `buf_size` bytes each.
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        let mut pool = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            pool.push_back(vec![0u8; buf_size]);
        }

        Self {
            pool: Arc::new(Mutex::new(pool)),
            buf_size,
            capacity,
        }
    }

    /// Acquires a buffer, allocating a fresh one if the pool is empty.
    ///
    /// The buffer is zero-filled to `buf_size` so no bytes from a previous
    /// connection leak through.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = {
            let mut pool = self.pool.lock().unwrap();
            pool.pop_front()
        };

        let mut buf = buf.unwrap_or_else(|| vec![0u8; self.buf_size]);
        buf.clear();
        buf.resize(self.buf_size, 0);

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.pool),
            capacity: self.capacity,
        }
    }

    /// Approximate number of buffers currently checked in.
    pub fn available(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

/// Guard that returns its buffer to the pool on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<Mutex<VecDeque<Vec<u8>>>>,
    capacity: usize,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().expect("PooledBuffer is empty")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().expect("PooledBuffer is empty")
    }
}

impl Drop for PooledBuffer {
    #[inline]
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut pool = self.pool.lock().unwrap();
            if pool.len() < self.capacity {
                pool.push_back(buf);
            }
        }
    }
}
