//! Per-thread reusable buffer pool.
//!
//! Each worker (and the master) owns one pool; nothing here is shared
//! across threads, so the hot allocation path takes no locks. The pool
//! bounds *idle* memory only: buffers in use by services do not count
//! against the limit.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use crate::constants::MAX_BUFFER_SIZE;
use crate::svc_error;

/// A reusable byte buffer.
///
/// Dereferences to `Vec<u8>`, so the usual `Vec` API applies. Capacity
/// survives a round-trip through the pool; contents do not.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    fn with_capacity(n: usize) -> Self {
        Buffer {
            data: Vec::with_capacity(n),
        }
    }

    /// Grow capacity by doubling until at least `need`, capped at
    /// [`MAX_BUFFER_SIZE`].
    fn ensure_capacity(&mut self, need: usize) {
        let mut cap = self.data.capacity().max(64);
        while cap < need {
            if cap <= MAX_BUFFER_SIZE / 2 {
                cap *= 2;
            } else {
                cap = MAX_BUFFER_SIZE;
                break;
            }
        }
        if cap > self.data.capacity() {
            self.data.reserve_exact(cap - self.data.len());
        }
    }
}

impl Deref for Buffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

/// Free-list of idle buffers with a ceiling on idle bytes.
pub struct BufferPool {
    free: VecDeque<Buffer>,
    /// Bytes of capacity sitting idle in `free`.
    idle_bytes: usize,
    /// Ceiling on `idle_bytes`; release trims until back under it.
    limit: usize,
    /// Fresh allocations performed (diagnostics and tests).
    allocations: u64,
}

impl BufferPool {
    pub fn new(limit: usize) -> Self {
        BufferPool {
            free: VecDeque::new(),
            idle_bytes: 0,
            limit,
            allocations: 0,
        }
    }

    /// Get a buffer with capacity of at least `min_size`.
    ///
    /// Pops from the free-list when possible, growing the popped buffer
    /// if it is too small. Requests beyond [`MAX_BUFFER_SIZE`] are logged
    /// and clamped.
    pub fn acquire(&mut self, min_size: usize) -> Buffer {
        let min_size = if min_size > MAX_BUFFER_SIZE {
            svc_error!("buffer request {} exceeds cap {}", min_size, MAX_BUFFER_SIZE);
            MAX_BUFFER_SIZE
        } else {
            min_size
        };

        if let Some(mut buf) = self.free.pop_front() {
            self.idle_bytes -= buf.capacity();
            buf.ensure_capacity(min_size);
            return buf;
        }

        self.allocations += 1;
        Buffer::with_capacity(min_size.max(64))
    }

    /// Return a buffer to the free-list, then trim idle memory back
    /// under the configured limit.
    pub fn release(&mut self, mut buf: Buffer) {
        buf.clear();
        self.idle_bytes += buf.capacity();
        self.free.push_back(buf);

        while self.idle_bytes > self.limit {
            match self.free.pop_front() {
                Some(b) => self.idle_bytes -= b.capacity(),
                None => break,
            }
        }
    }

    pub fn idle_bytes(&self) -> usize {
        self.idle_bytes
    }

    pub fn idle_count(&self) -> usize {
        self.free.len()
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_then_acquire_reuses_capacity() {
        let mut pool = BufferPool::new(1 << 20);
        let buf = pool.acquire(4096);
        let allocs = pool.allocations();
        let cap = buf.capacity();
        assert!(cap >= 4096);

        pool.release(buf);
        let again = pool.acquire(1024);
        assert!(again.capacity() >= 1024);
        // same-or-smaller request comes out of the free-list, no fresh alloc
        assert_eq!(pool.allocations(), allocs);
    }

    #[test]
    fn test_acquire_grows_small_recycled_buffer() {
        let mut pool = BufferPool::new(1 << 20);
        let small = pool.acquire(64);
        pool.release(small);
        let big = pool.acquire(10_000);
        assert!(big.capacity() >= 10_000);
    }

    #[test]
    fn test_growth_doubles() {
        let mut b = Buffer::with_capacity(100);
        b.ensure_capacity(150);
        // 100 doubled once covers 150
        assert!(b.capacity() >= 200);
    }

    #[test]
    fn test_idle_limit_trims() {
        let mut pool = BufferPool::new(8192);
        let a = pool.acquire(8192);
        let b = pool.acquire(8192);
        pool.release(a);
        assert!(pool.idle_bytes() <= 8192);
        pool.release(b);
        // trimmed back under the ceiling, not everything retained
        assert!(pool.idle_bytes() <= 8192);
        assert!(pool.idle_count() <= 1);
    }

    #[test]
    fn test_release_clears_contents() {
        let mut pool = BufferPool::new(1 << 20);
        let mut buf = pool.acquire(16);
        buf.extend_from_slice(b"hello");
        pool.release(buf);
        let buf = pool.acquire(16);
        assert!(buf.is_empty());
    }
}
