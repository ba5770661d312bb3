//! Fabric-wide queue of pending socket lifecycle work, consumed by a single
//! polling thread.
//!
//! Any thread may submit work. Submission appends a request under the queue
//! lock and raises the wake signal; the polling thread drains the queue on its
//! next iteration and from then on is the only one to touch the entry.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, mpsc};

use parking_lot::Mutex;
use socket2::Socket;
use tracing::debug;

use crate::fabric::Fid;
use crate::protocol::{CmMessage, CmOp};
use crate::queue::EventQueue;
use crate::signal::Signal;
use crate::{Error, Result};

/// Kind of socket lifecycle transition an entry is waiting for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollKind {
    /// Active connect issued by an endpoint.
    Connect,
    /// Accept of a connection request by an endpoint.
    Accept,
    /// Listening socket of a passive endpoint, kept until the passive endpoint
    /// is closed.
    Passive,
    /// Connection accepted by a listening socket whose connection request has
    /// not been read yet.
    Incoming,
}

/// Sub-state of an entry, advanced only by the polling thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollState {
    /// Non-blocking connect in flight, waiting for writability.
    EstablishConn,
    /// Connection request being written.
    SendReq,
    /// Waiting for the peer's connection response.
    RecvResp,
    /// Waiting for the peer's connection request.
    RecvReq,
    /// Connection response being written.
    SendResp,
    /// Waiting for incoming connections.
    Listening,
}

/// Socket awaiting an asynchronous lifecycle transition.
pub struct PollEntry {
    pub(crate) fid: Fid,
    pub(crate) sock: Arc<Socket>,
    pub(crate) kind: PollKind,
    pub(crate) state: PollState,
    pub(crate) cm_data: Vec<u8>,
    pub(crate) auto_free: bool,
    pub(crate) eq: Arc<EventQueue>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) tx: Vec<u8>,
    pub(crate) tx_off: usize,
    pub(crate) rx: Vec<u8>,
}

impl PollEntry {
    fn new(
        fid: Fid,
        sock: Arc<Socket>,
        kind: PollKind,
        state: PollState,
        eq: Arc<EventQueue>,
    ) -> Self {
        Self {
            fid,
            sock,
            kind,
            state,
            cm_data: Vec::new(),
            auto_free: kind != PollKind::Passive,
            eq,
            peer: None,
            tx: Vec::new(),
            tx_off: 0,
            rx: Vec::new(),
        }
    }

    /// Entry for an active connect whose connection request carries
    /// `cm_data`.
    pub(crate) fn connect(
        fid: Fid,
        sock: Arc<Socket>,
        eq: Arc<EventQueue>,
        cm_data: &[u8],
    ) -> Self {
        let mut entry = Self::new(fid, sock, PollKind::Connect, PollState::EstablishConn, eq);
        entry.cm_data = cm_data.to_vec();
        entry
    }

    /// Entry for accepting a connection request, answering with `cm_data`.
    pub(crate) fn accept(fid: Fid, sock: Arc<Socket>, eq: Arc<EventQueue>, cm_data: &[u8]) -> Self {
        let mut entry = Self::new(fid, sock, PollKind::Accept, PollState::SendResp, eq);
        entry.cm_data = cm_data.to_vec();
        entry.tx = CmMessage::new(CmOp::ConnResp, cm_data).to_bytes();
        entry
    }

    /// Long-lived entry for a listening socket.
    pub(crate) fn passive(fid: Fid, sock: Arc<Socket>, eq: Arc<EventQueue>) -> Self {
        Self::new(fid, sock, PollKind::Passive, PollState::Listening, eq)
    }

    /// Entry for a socket accepted on behalf of the passive endpoint `fid`.
    pub(crate) fn incoming(
        fid: Fid,
        sock: Socket,
        eq: Arc<EventQueue>,
        peer: Option<SocketAddr>,
    ) -> Self {
        let mut entry = Self::new(fid, Arc::new(sock), PollKind::Incoming, PollState::RecvReq, eq);
        entry.peer = peer;
        entry
    }

    /// Endpoint the entry belongs to.
    pub fn fid(&self) -> Fid {
        self.fid
    }

    /// Kind of the entry.
    pub fn kind(&self) -> PollKind {
        self.kind
    }

    /// Current sub-state.
    pub fn state(&self) -> PollState {
        self.state
    }

    /// Returns `true` if the entry is freed once it reaches a terminal state.
    pub fn auto_free(&self) -> bool {
        self.auto_free
    }

    /// `poll(2)` events the entry is waiting for in its current state.
    pub(crate) fn events(&self) -> i16 {
        match self.state {
            PollState::EstablishConn | PollState::SendReq | PollState::SendResp => libc::POLLOUT,
            PollState::RecvResp | PollState::RecvReq | PollState::Listening => libc::POLLIN,
        }
    }
}

impl fmt::Debug for PollEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollEntry")
            .field("fid", &self.fid)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("cm_data_len", &self.cm_data.len())
            .field("auto_free", &self.auto_free)
            .finish()
    }
}

/// Request submitted to the polling thread.
#[derive(Debug)]
pub(crate) enum PollRequest {
    /// Start servicing an entry.
    Insert(PollEntry),
    /// Unlink and drop every entry of `fid`, then acknowledge.
    Remove { fid: Fid, ack: mpsc::Sender<()> },
}

#[derive(Debug)]
struct PollQueue {
    requests: VecDeque<PollRequest>,
    running: bool,
    shutdown: bool,
}

/// Work queue and wake signal shared between submitters and the polling
/// thread.
#[derive(Debug)]
pub struct PollManager {
    queue: Mutex<PollQueue>,
    signal: Signal,
}

impl PollManager {
    /// Creates an empty work queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake signal could not be created.
    pub fn new() -> Result<Self> {
        Ok(Self {
            queue: Mutex::new(PollQueue {
                requests: VecDeque::new(),
                running: true,
                shutdown: false,
            }),
            signal: Signal::new()?,
        })
    }

    /// Appends `entry` and wakes the polling thread.
    ///
    /// # Errors
    ///
    /// Returns [Error::Closed] if the polling thread has exited.
    pub(crate) fn insert(&self, entry: PollEntry) -> Result<()> {
        {
            let mut queue = self.queue.lock();
            if !queue.running {
                return Err(Error::Closed);
            }

            debug!("[{}] ({:?}) queued {:?}", entry.fid, entry.state, entry.kind);
            queue.requests.push_back(PollRequest::Insert(entry));
        }

        self.signal.set();

        Ok(())
    }

    /// Removes every entry of `fid` from the polling thread, blocking until the
    /// thread acknowledges that it no longer references any of them.
    pub(crate) fn remove(&self, fid: Fid) {
        let (tx, rx) = mpsc::channel();

        {
            let mut queue = self.queue.lock();
            if !queue.running {
                return;
            }

            queue.requests.push_back(PollRequest::Remove { fid, ack: tx });
        }

        self.signal.set();

        // Either the polling thread acknowledges, or it exits and drops the
        // request, which disconnects the channel.
        let _ = rx.recv();

        debug!("[{fid}] removal acknowledged");
    }

    /// Asks the polling thread to exit.
    pub fn shutdown(&self) {
        self.queue.lock().shutdown = true;
        self.signal.set();
    }

    /// Returns `true` once [PollManager::shutdown] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.queue.lock().shutdown
    }

    /// Number of requests waiting to be picked up by the polling thread.
    pub fn pending(&self) -> usize {
        self.queue.lock().requests.len()
    }

    /// Wake signal of the polling thread.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub(crate) fn take_requests(&self) -> VecDeque<PollRequest> {
        mem::take(&mut self.queue.lock().requests)
    }

    /// Marks the polling thread as gone and returns whatever was still queued.
    /// Later submissions fail and removals return immediately.
    pub(crate) fn stop(&self) -> VecDeque<PollRequest> {
        let mut queue = self.queue.lock();
        queue.running = false;
        mem::take(&mut queue.requests)
    }
}
