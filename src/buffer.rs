//! Shared buffer arena with fixed size classes.
//!
//! Buffers are pre-allocated in two classes: read-class buffers sized for a
//! single read chunk, and response-class buffers sized for the largest fixed
//! response frame. Acquire/release run concurrently from acceptor, event-loop,
//! and business threads, so each free list is a lock-free `ArrayQueue`.
//!
//! Ownership is move-based: `acquire` hands out an owned `PooledBuf` and
//! `release` consumes it, so a buffer can never be touched after it has been
//! handed back. On exhaustion the arena allocates an overflow buffer that is
//! flagged so `release` drops it instead of pooling it; the pool therefore
//! never grows past its configured size.

use crossbeam_queue::ArrayQueue;
use tracing::{debug, warn};

/// Size of a read-class buffer: the maximum single-read chunk.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Size of a response-class buffer: the largest fixed response frame is
/// 54 bytes (6-byte header + 48-byte payload), rounded up.
pub const RESPONSE_BUFFER_SIZE: usize = 64;

/// Buffer capacity tier. Release validates a buffer against its class so a
/// short buffer can never be handed out where a full-size one is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Read,
    Response,
}

/// An owned, fixed-capacity byte buffer on loan from the arena.
///
/// Tracks a fill level so it doubles as a read-accumulation cursor and as a
/// write staging area.
pub struct PooledBuf {
    data: Box<[u8]>,
    len: usize,
    class: SizeClass,
    pooled: bool,
}

impl PooledBuf {
    fn new(data: Box<[u8]>, class: SizeClass, pooled: bool) -> Self {
        Self {
            data,
            len: 0,
            class,
            pooled,
        }
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of filled bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The filled region.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The writable region past the filled bytes.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Record `n` bytes written into the unfilled region.
    pub fn fill(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.data.len());
        self.len += n;
    }

    /// Drop the first `n` filled bytes, moving any remainder to the front so
    /// subsequent reads can append.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        if n == 0 {
            return;
        }
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Append bytes to the filled region.
    pub fn put_slice(&mut self, src: &[u8]) {
        debug_assert!(self.len + src.len() <= self.data.len());
        self.data[self.len..self.len + src.len()].copy_from_slice(src);
        self.len += src.len();
    }
}

struct ClassPool {
    slots: ArrayQueue<Box<[u8]>>,
    size: usize,
}

impl ClassPool {
    fn new(count: usize, size: usize) -> Self {
        let slots = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            let _ = slots.push(vec![0u8; size].into_boxed_slice());
        }
        Self { slots, size }
    }
}

/// Two-class pool of pre-allocated buffers shared by every thread.
pub struct BufferArena {
    read: ClassPool,
    response: ClassPool,
}

impl BufferArena {
    /// Create an arena with the standard size classes.
    pub fn new(read_count: usize, response_count: usize) -> Self {
        Self::with_sizes(
            read_count,
            READ_BUFFER_SIZE,
            response_count,
            RESPONSE_BUFFER_SIZE,
        )
    }

    /// Create an arena with explicit per-class capacities.
    pub fn with_sizes(
        read_count: usize,
        read_size: usize,
        response_count: usize,
        response_size: usize,
    ) -> Self {
        Self {
            read: ClassPool::new(read_count, read_size),
            response: ClassPool::new(response_count, response_size),
        }
    }

    fn pool(&self, class: SizeClass) -> &ClassPool {
        match class {
            SizeClass::Read => &self.read,
            SizeClass::Response => &self.response,
        }
    }

    /// Take a buffer of the given class.
    ///
    /// On pool exhaustion an overflow buffer is allocated instead; it is
    /// flagged so `release` drops it rather than growing the pool.
    pub fn acquire(&self, class: SizeClass) -> PooledBuf {
        let pool = self.pool(class);
        match pool.slots.pop() {
            Some(data) => PooledBuf::new(data, class, true),
            None => {
                debug!(?class, "buffer pool exhausted, allocating overflow buffer");
                PooledBuf::new(vec![0u8; pool.size].into_boxed_slice(), class, false)
            }
        }
    }

    /// Hand a buffer back.
    ///
    /// A buffer whose capacity does not match its claimed class indicates a
    /// bug; it is reported and dropped, never placed in the wrong pool.
    /// Overflow buffers are dropped and reclaimed by the allocator.
    pub fn release(&self, buf: PooledBuf) {
        let pool = self.pool(buf.class);
        if buf.capacity() != pool.size {
            warn!(
                class = ?buf.class,
                capacity = buf.capacity(),
                expected = pool.size,
                "buffer released with mismatched capacity, dropping"
            );
            return;
        }
        if !buf.pooled {
            return;
        }
        // A full free list means this buffer is excess; drop it.
        let _ = pool.slots.push(buf.data);
    }

    /// Number of free buffers in the given class.
    pub fn available(&self, class: SizeClass) -> usize {
        self.pool(class).slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_accounting() {
        let arena = BufferArena::with_sizes(4, 128, 2, 32);

        assert_eq!(arena.available(SizeClass::Read), 4);
        assert_eq!(arena.available(SizeClass::Response), 2);

        let a = arena.acquire(SizeClass::Read);
        let b = arena.acquire(SizeClass::Read);
        assert_eq!(a.class(), SizeClass::Read);
        assert_eq!(a.capacity(), 128);
        assert_eq!(arena.available(SizeClass::Read), 2);

        arena.release(a);
        arena.release(b);
        assert_eq!(arena.available(SizeClass::Read), 4);
    }

    #[test]
    fn test_overflow_buffers_are_not_pooled() {
        let arena = BufferArena::with_sizes(1, 64, 1, 32);

        let pooled = arena.acquire(SizeClass::Read);
        assert_eq!(arena.available(SizeClass::Read), 0);

        // Exhausted: this one comes from the overflow path
        let overflow = arena.acquire(SizeClass::Read);
        assert_eq!(overflow.capacity(), 64);

        // Releasing the overflow buffer must not grow the pool
        arena.release(overflow);
        assert_eq!(arena.available(SizeClass::Read), 0);

        arena.release(pooled);
        assert_eq!(arena.available(SizeClass::Read), 1);
    }

    #[test]
    fn test_mismatched_capacity_is_dropped() {
        let small = BufferArena::with_sizes(1, 64, 1, 32);
        let arena = BufferArena::with_sizes(2, 128, 2, 32);

        // A read-class buffer from a differently sized arena must not enter
        // this arena's read pool.
        let foreign = small.acquire(SizeClass::Read);
        arena.release(foreign);
        assert_eq!(arena.available(SizeClass::Read), 2);
    }

    #[test]
    fn test_fill_consume_compaction() {
        let arena = BufferArena::with_sizes(1, 16, 1, 16);
        let mut buf = arena.acquire(SizeClass::Read);

        buf.put_slice(b"abcdef");
        assert_eq!(buf.as_slice(), b"abcdef");
        assert_eq!(buf.unfilled_mut().len(), 10);

        buf.consume(4);
        assert_eq!(buf.as_slice(), b"ef");

        buf.put_slice(b"gh");
        assert_eq!(buf.as_slice(), b"efgh");

        buf.consume(4);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_outstanding_never_exceeds_pool_plus_overflow() {
        let arena = BufferArena::with_sizes(3, 64, 1, 32);

        let all: Vec<_> = (0..5).map(|_| arena.acquire(SizeClass::Read)).collect();
        assert_eq!(arena.available(SizeClass::Read), 0);
        assert_eq!(all.iter().filter(|b| b.pooled).count(), 3);
        assert_eq!(all.iter().filter(|b| !b.pooled).count(), 2);

        for buf in all {
            arena.release(buf);
        }
        assert_eq!(arena.available(SizeClass::Read), 3);
    }
}
