//! Completion and event queues through which asynchronous results are
//! reported to the application.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};

use crate::fabric::Fid;
use crate::net::ConnHandle;

/// FIFO shared between the thread producing entries and the threads reading
/// them.
#[derive(Debug)]
struct Fifo<T> {
    entries: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Fifo<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    fn push(&self, entry: T) {
        self.entries.lock().push_back(entry);
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<T> {
        self.entries.lock().pop_front()
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();

        loop {
            if let Some(entry) = entries.pop_front() {
                return Some(entry);
            }

            if self.ready.wait_until(&mut entries, deadline).timed_out() {
                return entries.pop_front();
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Kind of operation a [Completion] reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompletionKind {
    /// A send finished; its buffers may be reused.
    Send,
    /// A posted receive was filled.
    Recv,
}

/// Result of a completed data transfer.
#[derive(Debug)]
pub struct Completion {
    /// Operation that completed.
    pub kind: CompletionKind,
    /// Endpoint the operation was issued on.
    pub ep: Fid,
    /// Opaque context supplied with the operation.
    pub context: u64,
    /// Number of payload bytes transferred.
    pub len: usize,
    /// Remote data carried by the message, if any.
    pub data: Option<u64>,
    /// Receive regions, each truncated to the bytes it received. Empty for
    /// sends.
    pub buffers: Vec<BytesMut>,
    /// Bytes of the inbound message that did not fit the posted regions.
    pub overflow: usize,
}

/// Queue of data transfer completions.
#[derive(Debug)]
pub struct CompletionQueue {
    fifo: Fifo<Completion>,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue {
    /// Creates an empty completion queue.
    pub fn new() -> Self {
        Self { fifo: Fifo::new() }
    }

    pub(crate) fn push(&self, completion: Completion) {
        self.fifo.push(completion);
    }

    /// Returns the oldest completion, if any, without blocking.
    pub fn read(&self) -> Option<Completion> {
        self.fifo.pop()
    }

    /// Waits up to `timeout` for a completion.
    pub fn sread(&self, timeout: Duration) -> Option<Completion> {
        self.fifo.pop_timeout(timeout)
    }

    /// Number of completions waiting to be read.
    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    /// Returns `true` if no completions are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connection management notification.
pub enum CmEvent {
    /// The connection of an active or accepting endpoint is established.
    Connected {
        /// Endpoint whose connection completed.
        fid: Fid,
        /// Setup payload sent by the peer.
        data: Vec<u8>,
    },
    /// A peer is asking a listening passive endpoint for a connection.
    ConnReq {
        /// Passive endpoint that received the request.
        fid: Fid,
        /// Connection to hand to a new endpoint before accepting it.
        handle: ConnHandle,
        /// Setup payload sent by the peer.
        data: Vec<u8>,
    },
    /// Connection setup failed.
    Error {
        /// Endpoint whose connection failed.
        fid: Fid,
        /// Cause of the failure.
        error: io::Error,
    },
}

impl CmEvent {
    /// Endpoint the event refers to.
    pub fn fid(&self) -> Fid {
        match self {
            CmEvent::Connected { fid, .. }
            | CmEvent::ConnReq { fid, .. }
            | CmEvent::Error { fid, .. } => *fid,
        }
    }
}

impl fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmEvent::Connected { fid, data } => f
                .debug_struct("Connected")
                .field("fid", fid)
                .field("data_len", &data.len())
                .finish(),
            CmEvent::ConnReq { fid, handle, data } => f
                .debug_struct("ConnReq")
                .field("fid", fid)
                .field("peer", &handle.peer_addr())
                .field("data_len", &data.len())
                .finish(),
            CmEvent::Error { fid, error } => f
                .debug_struct("Error")
                .field("fid", fid)
                .field("error", error)
                .finish(),
        }
    }
}

/// Queue of connection management events.
#[derive(Debug)]
pub struct EventQueue {
    fifo: Fifo<CmEvent>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Creates an empty event queue.
    pub fn new() -> Self {
        Self { fifo: Fifo::new() }
    }

    pub(crate) fn push(&self, event: CmEvent) {
        self.fifo.push(event);
    }

    /// Returns the oldest event, if any, without blocking.
    pub fn read(&self) -> Option<CmEvent> {
        self.fifo.pop()
    }

    /// Waits up to `timeout` for an event.
    pub fn sread(&self, timeout: Duration) -> Option<CmEvent> {
        self.fifo.pop_timeout(timeout)
    }

    /// Number of events waiting to be read.
    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    /// Returns `true` if no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
