//! Fixed-size buffer pool for wire packets.
//!
//! Every payload that crosses the proxy lives in a pooled buffer: the read
//! task fills one, ownership moves to the router, then to the destination's
//! write task, and the buffer returns to the free list when the final owner
//! drops it. The pool never hands the same buffer to two owners; release is
//! tied to `Drop` so a buffer cannot be returned twice.

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Upper bound on buffers kept on the free list; anything beyond this is
/// handed back to the allocator instead.
const DEFAULT_MAX_FREE: usize = 256;

#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buf_size: usize,
    max_free: usize,
    free: Mutex<Vec<BytesMut>>,
    /// Buffers currently held by some owner. Must return to zero when the
    /// proxy is idle; going negative is an invariant violation.
    outstanding: AtomicUsize,
    allocated_total: AtomicUsize,
}

impl PacketPool {
    pub fn new(buf_size: usize) -> Self {
        Self::with_max_free(buf_size, DEFAULT_MAX_FREE)
    }

    pub fn with_max_free(buf_size: usize, max_free: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buf_size,
                max_free,
                free: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
                allocated_total: AtomicUsize::new(0),
            }),
        }
    }

    /// Takes a buffer from the free list, or allocates a fresh one if the
    /// list is empty. The returned packet owns the buffer until dropped.
    pub fn alloc(&self) -> Packet {
        let buf = match self.inner.free.lock().expect("packet pool poisoned").pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => {
                self.inner.allocated_total.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.inner.buf_size)
            }
        };
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        Packet {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// Number of buffers currently owned outside the pool.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }

    /// Total number of buffers ever allocated (not recycled).
    pub fn allocated_total(&self) -> usize {
        self.inner.allocated_total.load(Ordering::Relaxed)
    }
}

impl PoolInner {
    fn release(&self, buf: BytesMut) {
        let prev = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        // A zero count here means a buffer was returned that the pool never
        // handed out; the accounting is broken and the process must not
        // continue shuffling data.
        assert!(prev > 0, "packet pool: released more buffers than allocated");
        let mut free = self.free.lock().expect("packet pool poisoned");
        if free.len() < self.max_free {
            free.push(buf);
        }
    }
}

/// A pooled wire buffer. Dereferences to `BytesMut`; the buffer goes back to
/// the pool when the packet is dropped.
pub struct Packet {
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Deref for Packet {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for Packet {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet(len = {})", self.buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_drop_balance() {
        let pool = PacketPool::new(1024);
        let a = pool.alloc();
        let b = pool.alloc();
        assert_eq!(pool.outstanding(), 2);
        drop(a);
        assert_eq!(pool.outstanding(), 1);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn freed_buffers_are_recycled() {
        let pool = PacketPool::new(1024);
        let mut p = pool.alloc();
        p.extend_from_slice(b"hello");
        drop(p);
        assert_eq!(pool.allocated_total(), 1);

        // The recycled buffer comes back empty.
        let p = pool.alloc();
        assert_eq!(pool.allocated_total(), 1);
        assert!(p.is_empty());
    }

    #[test]
    fn pool_grows_past_free_list() {
        let pool = PacketPool::with_max_free(64, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.alloc()).collect();
        assert_eq!(pool.outstanding(), 5);
        assert_eq!(pool.allocated_total(), 5);
        drop(bufs);
        assert_eq!(pool.outstanding(), 0);
        // Only max_free buffers are retained.
        let _again: Vec<_> = (0..5).map(|_| pool.alloc()).collect();
        assert_eq!(pool.allocated_total(), 8);
    }

    #[test]
    fn balance_over_interleaved_ownership_transfer() {
        let pool = PacketPool::new(256);
        let mut held = Vec::new();
        for i in 0..100 {
            let mut p = pool.alloc();
            p.extend_from_slice(&[i as u8]);
            if i % 3 == 0 {
                held.push(p);
            }
        }
        assert_eq!(pool.outstanding(), held.len());
        held.clear();
        assert_eq!(pool.outstanding(), 0);
    }
}
