//! Transfer buffers for cross-boundary payload handoff.
//!
//! A [`TransferBuffer`] describes one request or response payload on its way
//! between the native dispatcher and a script-execution context. Ownership
//! moves exactly once per leg of the journey: the sender calls
//! [`TransferBuffer::handoff`] and loses access (enforced by move
//! semantics), the receiver reads through the resulting [`BufferHandle`]
//! and finally returns the memory with [`BufferPool::release`].
//!
//! Buffers are recycled from per-size-class free lists so the hot path does
//! not allocate. A request larger than the biggest pooled class falls back
//! to a one-off allocation, tagged so `release` frees it instead of
//! recycling it.

use fastbridge_common::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Pooled buffer size classes, smallest first.
const SIZE_CLASSES: [usize; 3] = [4 * 1024, 64 * 1024, 1024 * 1024];

/// Maximum recycled buffers kept per size class.
const MAX_POOLED_PER_CLASS: usize = 32;

/// Payload encoding carried alongside the bytes.
///
/// A buffer has exactly one encoding for its whole lifetime; producer and
/// consumer never disagree on layout because the tag travels with the
/// handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Structured value, serialized as JSON.
    Json,
    /// Opaque bytes, passed through untouched.
    Bytes,
}

/// A writable payload region reserved from a [`BufferPool`].
///
/// Not `Clone`: there is exactly one owner at any time. The write side
/// fills it and then hands it off; after [`handoff`](Self::handoff) the
/// sender cannot touch the memory again.
#[derive(Debug)]
pub struct TransferBuffer {
    data: Vec<u8>,
    len: usize,
    encoding: Encoding,
    /// Index into `SIZE_CLASSES`, or `None` for a one-off allocation.
    class: Option<usize>,
}

impl TransferBuffer {
    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reserved capacity for this buffer.
    pub fn reserved(&self) -> usize {
        self.data.len()
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Copies `payload` into the reserved region.
    ///
    /// Fails with [`BridgeError::CapacityExceeded`] if the payload does not
    /// fit; the buffer is left unmodified in that case.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.data.len() {
            return Err(BridgeError::CapacityExceeded {
                needed: payload.len(),
                reserved: self.data.len(),
            });
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.len = payload.len();
        Ok(())
    }

    /// Transfers ownership to the receiving side.
    ///
    /// Consumes the buffer; the returned handle is read-only. This is the
    /// only way a payload crosses the dispatcher/context boundary.
    pub fn handoff(self) -> BufferHandle {
        BufferHandle { inner: self }
    }
}

/// The read-only, handed-off form of a [`TransferBuffer`].
///
/// Held by exactly one receiver; consumed by [`BufferPool::release`] (or
/// [`into_vec`](Self::into_vec) when the bytes must outlive the pool).
#[derive(Debug)]
pub struct BufferHandle {
    inner: TransferBuffer,
}

impl BufferHandle {
    /// The payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner.data[..self.inner.len]
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.encoding
    }

    /// Copies the payload out, releasing the backing memory to `pool`.
    pub fn into_vec(self, pool: &BufferPool) -> Vec<u8> {
        let bytes = self.as_slice().to_vec();
        pool.release(self);
        bytes
    }
}

/// Shared free-list pool of transfer buffers.
///
/// The free lists are the only structure the dispatcher threads mutate
/// concurrently; each list is behind its own mutex so no buffer can be
/// handed to two callers at once.
pub struct BufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; SIZE_CLASSES.len()],
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            classes: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
        }
    }

    /// Largest size served from the free lists.
    pub fn max_pooled_size() -> usize {
        SIZE_CLASSES[SIZE_CLASSES.len() - 1]
    }

    /// Reserves a buffer with room for at least `size` bytes.
    ///
    /// Recycles from the smallest fitting size class when possible; a
    /// request beyond the largest class gets a one-off allocation that will
    /// be freed, not recycled, on release.
    pub fn acquire(&self, size: usize, encoding: Encoding) -> TransferBuffer {
        match SIZE_CLASSES.iter().position(|&cap| size <= cap) {
            Some(class) => {
                let recycled = self.classes[class]
                    .lock()
                    .expect("buffer free list poisoned")
                    .pop();
                let data = recycled.unwrap_or_else(|| vec![0; SIZE_CLASSES[class]]);
                TransferBuffer {
                    data,
                    len: 0,
                    encoding,
                    class: Some(class),
                }
            }
            None => TransferBuffer {
                data: vec![0; size],
                len: 0,
                encoding,
                class: None,
            },
        }
    }

    /// Returns a consumed handle's memory to the pool.
    ///
    /// Pooled buffers go back on their free list (up to a per-class cap);
    /// one-off allocations are simply dropped.
    pub fn release(&self, handle: BufferHandle) {
        let buf = handle.inner;
        let Some(class) = buf.class else {
            return;
        };
        let mut list = self.classes[class]
            .lock()
            .expect("buffer free list poisoned");
        if list.len() < MAX_POOLED_PER_CLASS && buf.data.len() == SIZE_CLASSES[class] {
            list.push(buf.data);
        }
    }

    /// Number of buffers currently sitting on the free lists.
    pub fn recycled_count(&self) -> usize {
        self.classes
            .iter()
            .map(|c| c.lock().expect("buffer free list poisoned").len())
            .sum()
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
    fn test_acquire_picks_smallest_fitting_class() {
        let pool = BufferPool::new();
        assert_eq!(pool.acquire(100, Encoding::Bytes).reserved(), 4 * 1024);
        assert_eq!(pool.acquire(4096, Encoding::Bytes).reserved(), 4 * 1024);
        assert_eq!(pool.acquire(4097, Encoding::Bytes).reserved(), 64 * 1024);
        assert_eq!(
            pool.acquire(1024 * 1024, Encoding::Bytes).reserved(),
            1024 * 1024
        );
    }

    #[test]
    fn test_oversize_acquire_is_one_off() {
        let pool = BufferPool::new();
        let size = BufferPool::max_pooled_size() + 1;
        let buf = pool.acquire(size, Encoding::Bytes);
        assert_eq!(buf.reserved(), size);
        assert!(buf.class.is_none());

        pool.release(buf.handoff());
        // one-off allocations are freed, never recycled
        assert_eq!(pool.recycled_count(), 0);
    }

    #[test]
    fn test_write_rejects_overflow() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(16, Encoding::Bytes);
        let reserved = buf.reserved();
        let too_big = vec![0u8; reserved + 1];

        let err = buf.write(&too_big).unwrap_err();
        match err {
            BridgeError::CapacityExceeded { needed, reserved: r } => {
                assert_eq!(needed, reserved + 1);
                assert_eq!(r, reserved);
            }
            other => panic!("expected CapacityExceeded, got {other}"),
        }
        // failed write leaves the buffer empty
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_round_trip_preserves_payload() {
        let pool = BufferPool::new();
        // 0 bytes, each class boundary, and one over the largest class
        let mut sizes = vec![0usize, 1];
        sizes.extend(SIZE_CLASSES);
        sizes.push(BufferPool::max_pooled_size() + 1);

        for size in sizes {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut buf = pool.acquire(size, Encoding::Bytes);
            buf.write(&payload).unwrap();

            let handle = buf.handoff();
            assert_eq!(handle.as_slice(), payload.as_slice(), "size {size}");
            pool.release(handle);
        }
    }

    #[test]
    fn test_release_recycles_for_reuse() {
        let pool = BufferPool::new();
        let buf = pool.acquire(64, Encoding::Bytes);
        pool.release(buf.handoff());
        assert_eq!(pool.recycled_count(), 1);

        let _again = pool.acquire(64, Encoding::Bytes);
        assert_eq!(pool.recycled_count(), 0);
    }

    #[test]
    fn test_recycle_cap_per_class() {
        let pool = BufferPool::new();
        let handles: Vec<_> = (0..MAX_POOLED_PER_CLASS + 5)
            .map(|_| pool.acquire(8, Encoding::Bytes).handoff())
            .collect();
        for handle in handles {
            pool.release(handle);
        }
        assert_eq!(pool.recycled_count(), MAX_POOLED_PER_CLASS);
    }

    #[test]
    fn test_encoding_travels_with_handle() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(8, Encoding::Json);
        buf.write(b"{}").unwrap();
        let handle = buf.handoff();
        assert_eq!(handle.encoding(), Encoding::Json);
    }

    #[test]
    fn test_concurrent_acquire_release_single_owner() {
        use std::sync::Arc;

        let pool = Arc::new(BufferPool::new());
        let mut threads = Vec::new();
        for t in 0..8 {
            let pool = Arc::clone(&pool);
            threads.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let payload = vec![t as u8; (i % 64) + 1];
                    let mut buf = pool.acquire(payload.len(), Encoding::Bytes);
                    buf.write(&payload).unwrap();
                    let handle = buf.handoff();
                    // every byte must still be ours; a buffer shared by two
                    // owners would show someone else's fill pattern
                    assert!(handle.as_slice().iter().all(|&b| b == t as u8));
                    pool.release(handle);
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
    }
}
