//! Fixed-capacity byte ring with write/commit semantics.
//!
//! Producers are serialized by a lock: each one obtains a [RingWriter], writes
//! any number of byte slices, then commits them in one step. Bytes written
//! but not committed are discarded when the writer is dropped, so a partially
//! written frame is never observable.
//!
//! A single consumer obtains a [RingReader] and only ever sees committed
//! bytes. It does not take the producer lock: the committed and consumed
//! cursors are atomics, and the ranges each side touches never overlap.

use std::cell::UnsafeCell;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::{Error, Result};

/// Multiple-producer, single-consumer byte ring.
pub struct RingBuffer {
    buf: Box<[UnsafeCell<u8>]>,
    mask: usize,
    /// Producer write cursor. Bytes in `committed..filled` are written but not
    /// yet visible to the consumer.
    filled: Mutex<usize>,
    committed: AtomicUsize,
    consumed: AtomicUsize,
    reading: AtomicBool,
}

// SAFETY: producers only write to `filled..filled + avail`, which the consumer
// never reads, and are serialized by `filled`. The consumer only reads
// `consumed..committed` and is unique thanks to `reading`. The cursors are
// published with release/acquire ordering.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Creates a ring able to hold `size` bytes, rounded up to a power of two.
    pub fn with_capacity(size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        let buf = (0..size).map(|_| UnsafeCell::new(0u8)).collect();

        Self {
            buf,
            mask: size - 1,
            filled: Mutex::new(0),
            committed: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
            reading: AtomicBool::new(false),
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Free space, in bytes, not occupied by committed data.
    pub fn avail(&self) -> usize {
        let committed = self.committed.load(Ordering::Acquire);
        let consumed = self.consumed.load(Ordering::Acquire);
        self.capacity() - committed.wrapping_sub(consumed)
    }

    /// Committed bytes not yet consumed.
    pub fn readable(&self) -> usize {
        let committed = self.committed.load(Ordering::Acquire);
        committed.wrapping_sub(self.consumed.load(Ordering::Acquire))
    }

    /// Returns `true` if there is no committed data left to consume.
    pub fn is_empty(&self) -> bool {
        self.readable() == 0
    }

    /// Acquires the producer lock.
    pub fn writer(&self) -> RingWriter<'_> {
        RingWriter {
            ring: self,
            filled: self.filled.lock(),
        }
    }

    /// Claims the consumer side. Returns `None` if another reader is active.
    pub fn reader(&self) -> Option<RingReader<'_>> {
        self.reading
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RingReader { ring: self })
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buf.as_ptr())
    }

    /// Copies `data` into the ring starting at absolute position `pos`.
    ///
    /// # Safety
    ///
    /// The caller must hold the producer lock and `data.len()` must not exceed
    /// the free space after `pos`.
    unsafe fn copy_in(&self, pos: usize, data: &[u8]) {
        let offset = pos & self.mask;
        let first = data.len().min(self.capacity() - offset);

        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(offset), first);
            ptr::copy_nonoverlapping(data[first..].as_ptr(), self.base(), data.len() - first);
        }
    }

    /// Copies `out.len()` bytes out of the ring starting at absolute position
    /// `pos`.
    ///
    /// # Safety
    ///
    /// The caller must be the unique reader and `pos..pos + out.len()` must lie
    /// within committed, unconsumed data.
    unsafe fn copy_out(&self, pos: usize, out: &mut [u8]) {
        let offset = pos & self.mask;
        let first = out.len().min(self.capacity() - offset);

        unsafe {
            ptr::copy_nonoverlapping(self.base().add(offset), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.base(), out[first..].as_mut_ptr(), out.len() - first);
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("committed", &self.committed.load(Ordering::Relaxed))
            .field("consumed", &self.consumed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Exclusive producer access to a [RingBuffer].
#[derive(Debug)]
pub struct RingWriter<'a> {
    ring: &'a RingBuffer,
    filled: MutexGuard<'a, usize>,
}

impl RingWriter<'_> {
    /// Free space remaining for this writer, accounting for bytes already
    /// written but not committed.
    pub fn avail(&self) -> usize {
        let consumed = self.ring.consumed.load(Ordering::Acquire);
        self.ring.capacity() - self.filled.wrapping_sub(consumed)
    }

    /// Appends `data` to the uncommitted region.
    ///
    /// # Errors
    ///
    /// Returns [Error::Again] without writing anything if `data` does not fit.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let available = self.avail();
        if data.len() > available {
            return Err(Error::Again {
                needed: data.len(),
                available,
            });
        }

        // SAFETY: the producer lock is held through `filled` and the length
        // was checked against the free space above.
        unsafe { self.ring.copy_in(*self.filled, data) };
        *self.filled = self.filled.wrapping_add(data.len());

        Ok(())
    }

    /// Publishes everything written so far to the consumer.
    pub fn commit(self) {
        self.ring.committed.store(*self.filled, Ordering::Release);
    }
}

impl io::Write for RingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RingWriter::write(self, buf)
            .map(|_| buf.len())
            .map_err(|err| io::Error::new(io::ErrorKind::WriteZero, err.to_string()))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RingWriter<'_> {
    fn drop(&mut self) {
        // Discard anything written but not committed.
        *self.filled = self.ring.committed.load(Ordering::Relaxed);
    }
}

/// Unique consumer access to a [RingBuffer].
#[derive(Debug)]
pub struct RingReader<'a> {
    ring: &'a RingBuffer,
}

impl RingReader<'_> {
    /// Committed bytes not yet consumed.
    pub fn readable(&self) -> usize {
        self.ring.readable()
    }

    /// Copies up to `out.len()` committed bytes without consuming them.
    /// Returns the number of bytes copied.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let nbytes = out.len().min(self.readable());
        let consumed = self.ring.consumed.load(Ordering::Relaxed);

        // SAFETY: this is the unique reader and `nbytes` is bounded by the
        // committed, unconsumed length.
        unsafe { self.ring.copy_out(consumed, &mut out[..nbytes]) };

        nbytes
    }

    /// Releases `nbytes` of committed data back to the producers.
    ///
    /// # Panics
    ///
    /// Panics if `nbytes` exceeds [RingReader::readable].
    pub fn consume(&mut self, nbytes: usize) {
        assert!(
            nbytes <= self.readable(),
            "consumed {nbytes} bytes, only {} readable",
            self.readable()
        );

        self.ring.consumed.fetch_add(nbytes, Ordering::Release);
    }

    /// Reads and consumes exactly `out.len()` bytes. Returns `false`, consuming
    /// nothing, if not enough committed data is available.
    pub fn read_exact(&mut self, out: &mut [u8]) -> bool {
        if out.len() > self.readable() {
            return false;
        }

        self.peek(out);
        self.consume(out.len());

        true
    }
}

impl io::Read for RingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let nbytes = self.peek(buf);
        self.consume(nbytes);
        Ok(nbytes)
    }
}

impl Drop for RingReader<'_> {
    fn drop(&mut self) {
        self.ring.reading.store(false, Ordering::Release);
    }
}
