//! Posted receive descriptors and the bounded pool they are allocated from.

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::fabric::Fid;
use crate::{Error, Result};

/// Receive buffers and completion context supplied by the caller.
#[derive(Debug, Default)]
pub struct RecvMsg {
    /// Destination regions, filled in order. Each region's capacity to be
    /// filled is its current length.
    pub iov: Vec<BytesMut>,
    /// Opaque value reported back in the receive completion.
    pub context: u64,
}

impl RecvMsg {
    /// Creates a single-region receive.
    pub fn new(buf: BytesMut, context: u64) -> Self {
        Self {
            iov: vec![buf],
            context,
        }
    }
}

/// A receive waiting for inbound data.
#[derive(Debug)]
pub struct PostedRx {
    pub(crate) ep: Fid,
    pub(crate) flags: u64,
    pub(crate) context: u64,
    pub(crate) iov: Vec<BytesMut>,
    pub(crate) data_len: usize,
}

impl PostedRx {
    pub(crate) fn new(ep: Fid, msg: RecvMsg, flags: u64) -> Self {
        let data_len = msg.iov.iter().map(BytesMut::len).sum();

        Self {
            ep,
            flags,
            context: msg.context,
            iov: msg.iov,
            data_len,
        }
    }

    /// Endpoint the receive was posted on.
    pub fn ep(&self) -> Fid {
        self.ep
    }

    /// Flags given when the receive was posted.
    pub fn flags(&self) -> u64 {
        self.flags
    }

    /// Opaque completion context.
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Total capacity across all regions.
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Copies `data` into the regions in order, truncating each region to the
    /// bytes it received. Returns the number of bytes placed and the regions.
    pub(crate) fn scatter(self, data: &[u8]) -> (usize, Vec<BytesMut>) {
        let mut remaining = data;
        let mut iov = self.iov;

        for region in iov.iter_mut() {
            let nbytes = region.len().min(remaining.len());
            region[..nbytes].copy_from_slice(&remaining[..nbytes]);
            region.truncate(nbytes);
            remaining = &remaining[nbytes..];
        }

        (data.len() - remaining.len(), iov)
    }
}

/// Handle to a descriptor held by an [RxPool].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RxKey(usize);

#[derive(Debug)]
struct RxSlots {
    slots: Vec<Option<PostedRx>>,
    free_list: Vec<usize>,
}

/// Fixed-size pool of posted receive descriptors.
///
/// Allocation fails with [Error::NoMem] once every slot is in use; the pool
/// never grows.
#[derive(Debug)]
pub struct RxPool {
    inner: Mutex<RxSlots>,
    capacity: usize,
}

impl RxPool {
    /// Creates a pool of `capacity` descriptors.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RxSlots {
                slots: (0..capacity).map(|_| None).collect(),
                free_list: (0..capacity).rev().collect(),
            }),
            capacity,
        }
    }

    /// Stores `rx` in a free slot.
    ///
    /// # Errors
    ///
    /// Returns [Error::NoMem] if every slot is in use.
    pub fn alloc(&self, rx: PostedRx) -> Result<RxKey> {
        let mut inner = self.inner.lock();

        let idx = inner.free_list.pop().ok_or(Error::NoMem {
            capacity: self.capacity,
        })?;
        inner.slots[idx] = Some(rx);

        Ok(RxKey(idx))
    }

    /// Removes the descriptor at `key`, returning its slot to the pool.
    pub fn free(&self, key: RxKey) -> Option<PostedRx> {
        let mut inner = self.inner.lock();

        let rx = inner.slots.get_mut(key.0)?.take()?;
        inner.free_list.push(key.0);

        Some(rx)
    }

    /// Number of descriptors currently allocated.
    pub fn in_use(&self) -> usize {
        self.capacity - self.inner.lock().free_list.len()
    }

    /// Total number of descriptors.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
