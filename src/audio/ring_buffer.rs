//! Lock-free single-producer single-consumer (SPSC) byte ring buffer.
//!
//! This is the handoff between the process thread and the control thread:
//!   - One thread WRITES bytes into the buffer (producer)
//!   - One thread READS bytes from the buffer (consumer)
//!   - NO MUTEX is ever used, only atomic read/write positions
//!   - Neither side ever blocks or allocates after construction
//!
//! Positions advance modulo `2 * capacity`, so a full buffer (distance ==
//! capacity) and an empty one (distance == 0) never look alike. Every byte
//! of storage is usable and the capacity does not need to be a power of two.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Largest capacity the position arithmetic supports without overflow.
pub const MAX_CAPACITY: usize = isize::MAX as usize / 2;

struct Shared {
    /// The byte storage. Fixed-size, allocated once.
    storage: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    /// Write position (only modified by the producer).
    write_pos: AtomicUsize,
    /// Read position (only modified by the consumer).
    read_pos: AtomicUsize,
}

// Safety: storage is only touched between positions the owning side has
// exclusive rights to, and positions are published with Release and
// observed with Acquire.
unsafe impl Sync for Shared {}

impl Shared {
    fn allocate(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        if capacity > MAX_CAPACITY {
            return Err(Error::CapacityTooLarge {
                requested: capacity,
                max: MAX_CAPACITY,
            });
        }

        let mut storage: Vec<UnsafeCell<u8>> = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| Error::Allocation { capacity })?;
        storage.resize_with(capacity, || UnsafeCell::new(0));

        Ok(Self {
            storage: storage.into_boxed_slice(),
            capacity,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
        })
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    /// Moves a position forward by `n <= capacity`, wrapping at `2 * capacity`.
    #[inline]
    fn advance(&self, pos: usize, n: usize) -> usize {
        let next = pos + n;
        if next >= 2 * self.capacity {
            next - 2 * self.capacity
        } else {
            next
        }
    }

    /// Bytes between the read and write positions.
    #[inline]
    fn distance(&self, write: usize, read: usize) -> usize {
        if write >= read {
            write - read
        } else {
            write + 2 * self.capacity - read
        }
    }

    /// Storage index of a position.
    #[inline]
    fn slot(&self, pos: usize) -> usize {
        if pos >= self.capacity {
            pos - self.capacity
        } else {
            pos
        }
    }

    /// Splits `n` bytes starting at `pos` into the run up to the end of
    /// storage and the run wrapped to the start.
    #[inline]
    fn spans(&self, pos: usize, n: usize) -> (usize, usize) {
        let first = n.min(self.capacity - self.slot(pos));
        (first, n - first)
    }

    fn readable(&self) -> usize {
        // Read position first: it can only move towards the write position,
        // so the result never over-reports for the consumer.
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        self.distance(write, read).min(self.capacity)
    }

    fn writable(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        self.capacity - self.distance(write, read).min(self.capacity)
    }

    /// Safety: the caller must be the only writer.
    unsafe fn write(&self, src: &[u8]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let free = self.capacity - self.distance(write, read);
        let n = src.len().min(free);
        if n == 0 {
            return 0;
        }

        let (first, second) = self.spans(write, n);
        let base = self.base();
        ptr::copy_nonoverlapping(src.as_ptr(), base.add(self.slot(write)), first);
        ptr::copy_nonoverlapping(src.as_ptr().add(first), base, second);

        // Release: the bytes are visible before the new position is.
        self.write_pos.store(self.advance(write, n), Ordering::Release);
        n
    }

    /// Safety: the caller must be the only writer.
    unsafe fn commit(&self, n: usize) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let n = n.min(self.capacity - self.distance(write, read));
        if n > 0 {
            self.write_pos.store(self.advance(write, n), Ordering::Release);
        }
        n
    }

    /// Copies readable bytes into `dst` without consuming them. Returns the
    /// read position the copy started at and the count copied.
    ///
    /// Safety: the caller must be on the consumer side.
    unsafe fn copy_out(&self, dst: &mut [u8]) -> (usize, usize) {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);

        let n = dst.len().min(self.distance(write, read));
        if n == 0 {
            return (read, 0);
        }

        let (first, second) = self.spans(read, n);
        let base = self.base();
        ptr::copy_nonoverlapping(base.add(self.slot(read)), dst.as_mut_ptr(), first);
        ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), second);
        (read, n)
    }

    /// Safety: the caller must be the only reader.
    unsafe fn read(&self, dst: &mut [u8]) -> usize {
        let (read, n) = self.copy_out(dst);
        if n > 0 {
            // Release: the copy is finished before the producer may reuse the bytes.
            self.read_pos.store(self.advance(read, n), Ordering::Release);
        }
        n
    }

    /// Safety: the caller must be the only reader.
    unsafe fn skip(&self, n: usize) -> usize {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        let n = n.min(self.distance(write, read));
        if n > 0 {
            self.read_pos.store(self.advance(read, n), Ordering::Release);
        }
        n
    }

    /// Safety: the caller must be on the consumer side, and nothing may
    /// consume bytes while the slices are alive.
    unsafe fn readable_slices(&self) -> (&[u8], &[u8]) {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        let n = self.distance(write, read);
        let (first, second) = self.spans(read, n);
        let base = self.base();
        (
            slice::from_raw_parts(base.add(self.slot(read)), first),
            slice::from_raw_parts(base, second),
        )
    }

    /// Safety: the caller must be the only writer, and must hold exclusive
    /// access for as long as the slices are alive.
    #[allow(clippy::mut_from_ref)]
    unsafe fn writable_slices(&self) -> (&mut [u8], &mut [u8]) {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let n = self.capacity - self.distance(write, read);
        let (first, second) = self.spans(write, n);
        let base = self.base();
        (
            slice::from_raw_parts_mut(base.add(self.slot(write)), first),
            slice::from_raw_parts_mut(base, second),
        )
    }
}

/// A ring buffer owned by a single thread.
///
/// Use it directly when one thread both writes and reads, or call
/// [`RingBuffer::split`] to hand the two ends to two threads.
pub struct RingBuffer {
    shared: Arc<Shared>,
}

impl RingBuffer {
    /// Allocates `capacity` bytes of storage. Both positions start at zero.
    ///
    /// This is the only fallible operation: a zero or oversized capacity,
    /// or an allocation failure, returns an error instead of a buffer.
    pub fn new(capacity: usize) -> Result<Self> {
        let shared = Shared::allocate(capacity)?;
        log::debug!("Allocated ring buffer of {} bytes", capacity);
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of bytes available to read.
    pub fn readable_space(&self) -> usize {
        self.shared.readable()
    }

    /// Number of bytes that can be written.
    pub fn writable_space(&self) -> usize {
        self.shared.writable()
    }

    /// Writes as much of `src` as fits. Returns the number of bytes written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        // Safety: `&mut self` on the unsplit buffer excludes any other writer.
        unsafe { self.shared.write(src) }
    }

    /// Reads up to `dst.len()` bytes. Returns the number of bytes read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        // Safety: `&mut self` on the unsplit buffer excludes any other reader.
        unsafe { self.shared.read(dst) }
    }

    /// Copies up to `dst.len()` readable bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        // Safety: consuming needs `&mut self`, which this borrow excludes.
        unsafe { self.shared.copy_out(dst).1 }
    }

    /// Discards up to `n` readable bytes. Returns the number discarded.
    pub fn skip(&mut self, n: usize) -> usize {
        unsafe { self.shared.skip(n) }
    }

    /// Marks up to `n` bytes of the writable region as written.
    pub fn commit(&mut self, n: usize) -> usize {
        unsafe { self.shared.commit(n) }
    }

    /// Readable region as (up to end of storage, wrapped part).
    pub fn readable_slices(&self) -> (&[u8], &[u8]) {
        unsafe { self.shared.readable_slices() }
    }

    /// Writable region as (up to end of storage, wrapped part). Follow with
    /// [`RingBuffer::commit`] to publish what was filled in.
    pub fn writable_slices(&mut self) -> (&mut [u8], &mut [u8]) {
        unsafe { self.shared.writable_slices() }
    }

    /// Empties the buffer. Only possible before splitting, where no other
    /// thread can be holding an end.
    pub fn reset(&mut self) {
        self.shared.write_pos.store(0, Ordering::Relaxed);
        self.shared.read_pos.store(0, Ordering::Relaxed);
    }

    /// Splits the buffer into its writing and reading ends.
    pub fn split(self) -> (Producer, Consumer) {
        (
            Producer {
                shared: self.shared.clone(),
            },
            Consumer {
                shared: self.shared,
            },
        )
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("readable", &self.readable_space())
            .finish()
    }
}

/// Writing end of a split ring buffer. Only one exists per buffer.
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Free space; never over-reported from this side.
    pub fn writable_space(&self) -> usize {
        self.shared.writable()
    }

    pub fn readable_space(&self) -> usize {
        self.shared.readable()
    }

    /// Writes as much of `src` as fits. Returns the number of bytes written.
    /// Never blocks; returns 0 when the buffer is full.
    pub fn write(&mut self, src: &[u8]) -> usize {
        // Safety: the Producer is unique and `&mut self` serialises its use.
        unsafe { self.shared.write(src) }
    }

    /// Marks up to `n` bytes of the writable region as written.
    pub fn commit(&mut self, n: usize) -> usize {
        unsafe { self.shared.commit(n) }
    }

    /// Writable region for zero-copy filling. Follow with [`Producer::commit`].
    pub fn writable_slices(&mut self) -> (&mut [u8], &mut [u8]) {
        unsafe { self.shared.writable_slices() }
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.capacity())
            .field("writable", &self.writable_space())
            .finish()
    }
}

/// Reading end of a split ring buffer. Only one exists per buffer.
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Bytes available; never over-reported from this side.
    pub fn readable_space(&self) -> usize {
        self.shared.readable()
    }

    pub fn writable_space(&self) -> usize {
        self.shared.writable()
    }

    /// Reads up to `dst.len()` bytes. Returns the number of bytes read.
    /// Never blocks; returns 0 when the buffer is empty.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        // Safety: the Consumer is unique and `&mut self` serialises its use.
        unsafe { self.shared.read(dst) }
    }

    /// Copies up to `dst.len()` readable bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        unsafe { self.shared.copy_out(dst).1 }
    }

    /// Discards up to `n` readable bytes. Returns the number discarded.
    pub fn skip(&mut self, n: usize) -> usize {
        unsafe { self.shared.skip(n) }
    }

    /// Readable region for zero-copy access. Follow with [`Consumer::skip`].
    pub fn readable_slices(&self) -> (&[u8], &[u8]) {
        unsafe { self.shared.readable_slices() }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.capacity())
            .field("readable", &self.readable_space())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_rejects_bad_capacity() {
        assert_eq!(RingBuffer::new(0).unwrap_err(), Error::ZeroCapacity);
        assert!(matches!(
            RingBuffer::new(MAX_CAPACITY + 1),
            Err(Error::CapacityTooLarge { .. })
        ));
    }

    #[test]
    fn test_allocation_failure_is_an_error() {
        assert!(matches!(
            RingBuffer::new(MAX_CAPACITY),
            Err(Error::Allocation { capacity: MAX_CAPACITY })
        ));
    }

    #[test]
    fn test_new_is_empty() {
        let rb = RingBuffer::new(16).unwrap();
        assert_eq!(rb.capacity(), 16);
        assert_eq!(rb.readable_space(), 0);
        assert_eq!(rb.writable_space(), 16);
    }

    #[test]
    fn test_wraparound_scenario() {
        let mut rb = RingBuffer::new(8).unwrap();

        assert_eq!(rb.write(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(rb.readable_space(), 5);
        assert_eq!(rb.writable_space(), 3);

        let mut out = [0u8; 3];
        assert_eq!(rb.read(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(rb.readable_space(), 2);
        assert_eq!(rb.writable_space(), 6);

        assert_eq!(rb.write(&[6, 7, 8, 9]), 4);

        let mut out = [0u8; 6];
        assert_eq!(rb.read(&mut out), 6);
        assert_eq!(out, [4, 5, 6, 7, 8, 9]);
        assert_eq!(rb.readable_space(), 0);
    }

    #[test]
    fn test_full_capacity_is_usable() {
        let mut rb = RingBuffer::new(8).unwrap();
        let data: Vec<u8> = (10..18).collect();
        assert_eq!(rb.write(&data), 8);
        assert_eq!(rb.writable_space(), 0);
        assert_eq!(rb.write(&[99]), 0);

        let mut out = [0u8; 8];
        assert_eq!(rb.read(&mut out), 8);
        assert_eq!(&out[..], &data[..]);
        assert_eq!(rb.read(&mut out), 0);
    }

    #[test]
    fn test_short_write_and_read() {
        let mut rb = RingBuffer::new(5).unwrap();
        assert_eq!(rb.write(&[1, 2, 3, 4, 5, 6, 7]), 5);

        let mut out = [0u8; 10];
        assert_eq!(rb.read(&mut out), 5);
        assert_eq!(&out[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(&out[5..], &[0; 5]);
    }

    #[test]
    fn test_zero_length_requests() {
        let mut rb = RingBuffer::new(4).unwrap();
        assert_eq!(rb.write(&[]), 0);
        rb.write(&[1]);
        assert_eq!(rb.read(&mut []), 0);
        assert_eq!(rb.readable_space(), 1);
    }

    #[test]
    fn test_space_sums_to_capacity_across_many_wraps() {
        // 7 is deliberately not a power of two.
        let mut rb = RingBuffer::new(7).unwrap();
        let mut next = 0u8;
        let mut expected = 0u8;
        for round in 0..500 {
            let chunk: Vec<u8> = (0..(round % 6 + 1))
                .map(|_| {
                    let v = next;
                    next = next.wrapping_add(1);
                    v
                })
                .collect();
            let written = rb.write(&chunk);
            // Unwritten bytes are offered again next round.
            next = next.wrapping_sub((chunk.len() - written) as u8);
            assert_eq!(rb.readable_space() + rb.writable_space(), 7);

            let mut out = vec![0u8; round % 4 + 1];
            let n = rb.read(&mut out);
            for &b in &out[..n] {
                assert_eq!(b, expected);
                expected = expected.wrapping_add(1);
            }
            assert_eq!(rb.readable_space() + rb.writable_space(), 7);
        }
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut rb = RingBuffer::new(4).unwrap();
        rb.write(&[1, 2, 3]);
        let mut out = [0u8; 2];
        assert_eq!(rb.peek(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(rb.readable_space(), 3);

        assert_eq!(rb.skip(1), 1);
        let mut out = [0u8; 4];
        assert_eq!(rb.read(&mut out), 2);
        assert_eq!(&out[..2], &[2, 3]);
        assert_eq!(rb.skip(10), 0);
    }

    #[test]
    fn test_slices_wrap() {
        let mut rb = RingBuffer::new(6).unwrap();
        rb.write(&[1, 2, 3, 4]);
        rb.skip(3);

        {
            let (a, b) = rb.writable_slices();
            assert_eq!(a.len(), 2);
            assert_eq!(b.len(), 3);
            a.copy_from_slice(&[5, 6]);
            b[0] = 7;
        }
        assert_eq!(rb.commit(3), 3);

        let (a, b) = rb.readable_slices();
        assert_eq!(a, &[4, 5, 6]);
        assert_eq!(b, &[7]);
    }

    #[test]
    fn test_commit_is_clamped() {
        let mut rb = RingBuffer::new(4).unwrap();
        assert_eq!(rb.commit(9), 4);
        assert_eq!(rb.writable_space(), 0);
    }

    #[test]
    fn test_reset() {
        let mut rb = RingBuffer::new(4).unwrap();
        rb.write(&[1, 2, 3]);
        rb.reset();
        assert_eq!(rb.readable_space(), 0);
        assert_eq!(rb.writable_space(), 4);
    }

    #[test]
    fn test_split_across_threads() {
        let (mut producer, mut consumer) = RingBuffer::new(64).unwrap().split();
        const TOTAL: usize = 100_000;

        let writer = thread::spawn(move || {
            let mut sent = 0usize;
            while sent < TOTAL {
                let chunk: Vec<u8> = (sent..(sent + 17).min(TOTAL))
                    .map(|i| (i % 251) as u8)
                    .collect();
                let n = producer.write(&chunk);
                sent += n;
                if n == 0 {
                    thread::yield_now();
                }
            }
        });

        let mut received = 0usize;
        let mut buf = [0u8; 23];
        while received < TOTAL {
            let n = consumer.read(&mut buf);
            for &b in &buf[..n] {
                assert_eq!(b, (received % 251) as u8);
                received += 1;
            }
            if n == 0 {
                thread::yield_now();
            }
        }

        writer.join().unwrap();
        assert_eq!(consumer.readable_space(), 0);
    }
}
