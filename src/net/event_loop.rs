//! Polling thread driving connection setup and teardown for a fabric.
//!
//! The loop owns every [PollEntry] once it has been picked up from the
//! [PollManager] queue. Each iteration drains new requests, waits on the wake
//! signal plus every entry's socket, then advances the entries that became
//! ready. Entries that reach a terminal state report a [CmEvent] and, unless
//! they belong to a listening socket, are dropped.

use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::net::poll_mgr::{PollEntry, PollKind, PollManager, PollRequest, PollState};
use crate::net::socket::ConnHandle;
use crate::protocol::{CmMessage, CmOp};
use crate::queue::CmEvent;
use crate::{Error, Result, errno};

/// Size of each read while waiting for a connection management message.
const CM_READ_CHUNK: usize = 512;

/// Outcome of advancing an entry by one step.
enum Step {
    /// Still waiting on the socket.
    Pending(PollEntry),
    /// Reached a terminal state, with the event to report.
    Done(PollEntry, CmEvent),
    /// Consumed by the transition (incoming connection handed to the
    /// application).
    Consumed,
}

/// Single-threaded state machine over every pending socket of a fabric.
#[derive(Debug)]
pub struct PollLoop {
    mgr: Arc<PollManager>,
    entries: Vec<PollEntry>,
    max_cm_data_size: usize,
}

impl PollLoop {
    /// Creates a loop servicing `mgr`'s queue. Connection management payloads
    /// longer than `max_cm_data_size` are rejected.
    pub fn new(mgr: Arc<PollManager>, max_cm_data_size: usize) -> Self {
        Self {
            mgr,
            entries: Vec::new(),
            max_cm_data_size,
        }
    }

    /// Number of entries currently owned by the loop.
    pub fn entries(&self) -> usize {
        self.entries.len()
    }

    /// Runs until the manager is shut down, waiting at most `timeout` per
    /// iteration.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the sockets fails.
    pub fn run(mut self, timeout: Duration) -> Result<()> {
        info!("polling thread started");

        while !self.mgr.is_shutdown() {
            self.run_once(Some(timeout))?;
        }

        info!("polling thread exiting");

        Ok(())
    }

    /// Performs one iteration: drains queued requests, waits up to `timeout`
    /// (`None` blocks until something is ready) and advances ready entries.
    ///
    /// # Errors
    ///
    /// Returns an error if `poll(2)` fails for a reason other than an
    /// interrupted call.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.process_requests();

        let mut fds = Vec::with_capacity(self.entries.len() + 1);
        fds.push(libc::pollfd {
            fd: self.mgr.signal().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        fds.extend(self.entries.iter().map(|entry| libc::pollfd {
            fd: entry.sock.as_raw_fd(),
            events: entry.events(),
            revents: 0,
        }));

        let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);

        let rdfs = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rdfs == -1 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(errno!("failed to wait on poll"));
        }

        // Requests raised during the wait are picked up at the start of the
        // next iteration; a removal is acknowledged only then.
        if fds[0].revents & libc::POLLIN != 0 {
            self.mgr.signal().reset();
        }

        if rdfs == 0 {
            return Ok(());
        }

        let entries = mem::take(&mut self.entries);
        let mut incoming = Vec::new();

        for (entry, pfd) in entries.into_iter().zip(fds[1..].iter()) {
            if pfd.revents == 0 {
                self.entries.push(entry);
                continue;
            }

            trace!(
                "[{}] ({:?}) revents {:#x}",
                entry.fid, entry.state, pfd.revents
            );

            match self.advance(entry, pfd.revents, &mut incoming) {
                Step::Pending(entry) => self.entries.push(entry),
                Step::Done(entry, event) => {
                    debug!("[{}] ({:?}) reporting {event:?}", entry.fid, entry.kind);
                    entry.eq.push(event);

                    if !entry.auto_free {
                        self.entries.push(entry);
                    }
                }
                Step::Consumed => {}
            }
        }

        self.entries.extend(incoming);

        Ok(())
    }

    fn process_requests(&mut self) {
        for request in self.mgr.take_requests() {
            match request {
                PollRequest::Insert(entry) => {
                    debug!("[{}] ({:?}) registered {:?}", entry.fid, entry.state, entry.kind);
                    self.entries.push(entry);
                }
                PollRequest::Remove { fid, ack } => {
                    let before = self.entries.len();
                    self.entries.retain(|entry| entry.fid != fid);

                    debug!("[{fid}] removed {} entries", before - self.entries.len());

                    // The requester may have given up waiting.
                    let _ = ack.send(());
                }
            }
        }
    }

    fn advance(&self, mut entry: PollEntry, revents: i16, incoming: &mut Vec<PollEntry>) -> Step {
        match entry.state {
            PollState::EstablishConn => {
                if let Some(err) = connect_error(&entry, revents) {
                    return fail(entry, err);
                }

                debug!("[{}] connection established", entry.fid);

                entry.tx = CmMessage::new(CmOp::ConnReq, &entry.cm_data).to_bytes();
                entry.tx_off = 0;
                entry.state = PollState::SendReq;

                self.flush(entry)
            }
            PollState::SendReq | PollState::SendResp => self.flush(entry),
            PollState::RecvResp | PollState::RecvReq => self.fill(entry),
            PollState::Listening => {
                accept_pending(&entry, incoming);
                Step::Pending(entry)
            }
        }
    }

    /// Writes the pending connection management message.
    fn flush(&self, mut entry: PollEntry) -> Step {
        while entry.tx_off < entry.tx.len() {
            match (&*entry.sock).write(&entry.tx[entry.tx_off..]) {
                Ok(0) => return fail(entry, io::ErrorKind::WriteZero.into()),
                Ok(nbytes) => entry.tx_off += nbytes,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Step::Pending(entry),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return fail(entry, err),
            }
        }

        match entry.state {
            PollState::SendReq => {
                entry.state = PollState::RecvResp;
                Step::Pending(entry)
            }
            _ => {
                let event = CmEvent::Connected {
                    fid: entry.fid,
                    data: Vec::new(),
                };
                Step::Done(entry, event)
            }
        }
    }

    /// Reads towards a complete connection management message. Never reads
    /// past its end: whatever follows belongs to the data stream.
    fn fill(&self, mut entry: PollEntry) -> Step {
        let mut chunk = [0u8; CM_READ_CHUNK];

        loop {
            let remaining = match CmMessage::remaining(&entry.rx, self.max_cm_data_size) {
                Ok(0) => break,
                Ok(remaining) => remaining.min(CM_READ_CHUNK),
                Err(err) => return fail(entry, into_io(err)),
            };

            match (&*entry.sock).read(&mut chunk[..remaining]) {
                Ok(0) => return fail(entry, io::ErrorKind::UnexpectedEof.into()),
                Ok(nbytes) => entry.rx.extend_from_slice(&chunk[..nbytes]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Step::Pending(entry);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return fail(entry, err),
            }
        }

        let (msg, _) = match CmMessage::parse(&entry.rx, self.max_cm_data_size) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Step::Pending(entry),
            Err(err) => return fail(entry, into_io(err)),
        };

        let expected = match entry.state {
            PollState::RecvReq => CmOp::ConnReq,
            _ => CmOp::ConnResp,
        };
        if msg.op() != expected {
            let err = io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {expected:?}, received {:?}", msg.op()),
            );
            return fail(entry, err);
        }

        match entry.state {
            PollState::RecvReq => {
                let fid = entry.fid;
                let eq = Arc::clone(&entry.eq);
                let peer = entry.peer;

                let Ok(sock) = Arc::try_unwrap(entry.sock) else {
                    warn!("[{fid}] incoming connection still shared, dropping");
                    return Step::Consumed;
                };

                debug!("[{fid}] connection request from {peer:?}");

                eq.push(CmEvent::ConnReq {
                    fid,
                    handle: ConnHandle::new(sock, peer),
                    data: msg.into_data(),
                });

                Step::Consumed
            }
            _ => {
                let event = CmEvent::Connected {
                    fid: entry.fid,
                    data: msg.into_data(),
                };
                Step::Done(entry, event)
            }
        }
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        // Dropping the queued requests disconnects any removal still waiting
        // for an acknowledgement.
        let pending = self.mgr.stop();
        if !pending.is_empty() {
            debug!("discarding {} queued requests", pending.len());
        }

        debug!("dropping {} entries", self.entries.len());
    }
}

/// Reports the failure of `entry`. Incoming connections that never produced a
/// request are dropped silently.
fn fail(entry: PollEntry, err: io::Error) -> Step {
    warn!("[{}] ({:?}) {:?} failed: {err}", entry.fid, entry.state, entry.kind);

    if entry.kind == PollKind::Incoming {
        return Step::Consumed;
    }

    let event = CmEvent::Error {
        fid: entry.fid,
        error: err,
    };
    Step::Done(entry, event)
}

/// Result of a non-blocking connect that became writable.
fn connect_error(entry: &PollEntry, revents: i16) -> Option<io::Error> {
    match entry.sock.take_error() {
        Ok(Some(err)) | Err(err) => Some(err),
        Ok(None) if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 => {
            Some(io::ErrorKind::ConnectionAborted.into())
        }
        Ok(None) => None,
    }
}

/// Accepts every connection pending on a listening socket.
fn accept_pending(entry: &PollEntry, incoming: &mut Vec<PollEntry>) {
    loop {
        match entry.sock.accept() {
            Ok((sock, addr)) => {
                let peer = addr.as_socket();

                if let Err(err) = sock.set_nonblocking(true).and_then(|_| sock.set_nodelay(true)) {
                    warn!("[{}] failed to set up accepted socket: {err}", entry.fid);
                    continue;
                }

                debug!("[{}] accepted connection from {peer:?}", entry.fid);

                incoming.push(PollEntry::incoming(
                    entry.fid,
                    sock,
                    Arc::clone(&entry.eq),
                    peer,
                ));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!("[{}] failed to accept connection: {err}", entry.fid);
                entry.eq.push(CmEvent::Error {
                    fid: entry.fid,
                    error: err,
                });
                break;
            }
        }
    }
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io(err) => err,
        err => io::Error::new(io::ErrorKind::InvalidData, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Fid;
    use crate::queue::EventQueue;
    use socket2::{Domain, Protocol, SockAddr, Socket, Type};
    use std::net::{SocketAddr, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn listener() -> (Arc<Socket>, SocketAddr) {
        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        sock.bind(&SockAddr::from(addr)).unwrap();
        sock.listen(16).unwrap();
        sock.set_nonblocking(true).unwrap();

        let local = sock.local_addr().unwrap().as_socket().unwrap();
        (Arc::new(sock), local)
    }

    fn step_until(poll_loop: &mut PollLoop, eq: &EventQueue) -> CmEvent {
        for _ in 0..100 {
            poll_loop.run_once(Some(Duration::from_millis(50))).unwrap();
            if let Some(event) = eq.read() {
                return event;
            }
        }
        panic!("no event reported");
    }

    #[test]
    fn poll_loop_passive_reports_conn_req() {
        let mgr = Arc::new(PollManager::new().unwrap());
        let mut poll_loop = PollLoop::new(Arc::clone(&mgr), 64);
        let eq = Arc::new(EventQueue::new());
        let (sock, addr) = listener();
        let fid = Fid::next();

        mgr.insert(PollEntry::passive(fid, sock, Arc::clone(&eq)))
            .unwrap();

        let mut peer = TcpStream::connect(addr).unwrap();
        peer.write_all(&CmMessage::new(CmOp::ConnReq, b"hello").to_bytes())
            .unwrap();

        let event = step_until(&mut poll_loop, &eq);
        assert!(matches!(
            event,
            CmEvent::ConnReq { fid: got, ref data, ref handle }
                if got == fid && data == b"hello" && handle.peer_addr().is_some()
        ));

        // The listening entry survives the request.
        assert_eq!(poll_loop.entries(), 1);
    }

    #[test]
    fn poll_loop_rejects_oversized_cm_data() {
        let mgr = Arc::new(PollManager::new().unwrap());
        let mut poll_loop = PollLoop::new(Arc::clone(&mgr), 4);
        let eq = Arc::new(EventQueue::new());
        let (sock, addr) = listener();

        mgr.insert(PollEntry::passive(Fid::next(), sock, Arc::clone(&eq)))
            .unwrap();

        let mut peer = TcpStream::connect(addr).unwrap();
        peer.write_all(&CmMessage::new(CmOp::ConnReq, b"too long").to_bytes())
            .unwrap();

        for _ in 0..10 {
            poll_loop.run_once(Some(Duration::from_millis(20))).unwrap();
        }

        // The incoming connection is dropped without surfacing an event.
        assert!(eq.is_empty());
        assert_eq!(poll_loop.entries(), 1);
    }

    #[test]
    fn poll_loop_connect_refused_reports_error() {
        let mgr = Arc::new(PollManager::new().unwrap());
        let mut poll_loop = PollLoop::new(Arc::clone(&mgr), 64);
        let eq = Arc::new(EventQueue::new());

        // Bind then drop to obtain a port nobody listens on.
        let addr = {
            let (_sock, addr) = listener();
            addr
        };

        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        sock.set_nonblocking(true).unwrap();
        match sock.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => return,
            Err(err) => panic!("{err}"),
        }

        let fid = Fid::next();
        mgr.insert(PollEntry::connect(fid, Arc::new(sock), Arc::clone(&eq), b""))
            .unwrap();

        let event = step_until(&mut poll_loop, &eq);
        assert!(matches!(event, CmEvent::Error { fid: got, .. } if got == fid));
        assert_eq!(poll_loop.entries(), 0);
    }

    #[test]
    fn poll_loop_remove_waits_for_slow_thread() {
        let mgr = Arc::new(PollManager::new().unwrap());
        let mut poll_loop = PollLoop::new(Arc::clone(&mgr), 64);
        let eq = Arc::new(EventQueue::new());
        let (sock, addr) = listener();
        let fid = Fid::next();

        mgr.insert(PollEntry::passive(fid, Arc::clone(&sock), eq))
            .unwrap();
        poll_loop.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(poll_loop.entries(), 1);

        let removed = Arc::new(AtomicBool::new(false));
        let closer = {
            let mgr = Arc::clone(&mgr);
            let removed = Arc::clone(&removed);
            thread::spawn(move || {
                mgr.remove(fid);
                removed.store(true, Ordering::SeqCst);
            })
        };

        // The polling thread has not run, so the removal must still be
        // waiting.
        thread::sleep(Duration::from_millis(100));
        assert!(!removed.load(Ordering::SeqCst));
        assert_eq!(mgr.pending(), 1);

        poll_loop.run_once(Some(Duration::ZERO)).unwrap();
        closer.join().unwrap();

        assert!(removed.load(Ordering::SeqCst));
        assert_eq!(poll_loop.entries(), 0);

        // Only the test still references the listening socket, so closing it
        // frees the port.
        assert_eq!(Arc::strong_count(&sock), 1);
        drop(sock);
        assert!(std::net::TcpListener::bind(addr).is_ok());
    }

    #[test]
    fn poll_loop_drop_releases_waiting_removal() {
        let mgr = Arc::new(PollManager::new().unwrap());
        let poll_loop = PollLoop::new(Arc::clone(&mgr), 64);
        let fid = Fid::next();

        let closer = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.remove(fid))
        };

        while mgr.pending() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        drop(poll_loop);
        closer.join().unwrap();
    }

    #[test]
    fn poll_loop_connect_keeps_bytes_after_response() {
        let mgr = Arc::new(PollManager::new().unwrap());
        let mut poll_loop = PollLoop::new(Arc::clone(&mgr), 64);
        let eq = Arc::new(EventQueue::new());
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let sock = Arc::new(sock);
        sock.set_nonblocking(true).unwrap();
        match sock.connect(&SockAddr::from(listener.local_addr().unwrap())) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) => panic!("{err}"),
        }

        let fid = Fid::next();
        mgr.insert(PollEntry::connect(fid, Arc::clone(&sock), Arc::clone(&eq), b"req"))
            .unwrap();

        // The accepting side answers and starts sending data right away, in
        // the same segment as its response.
        let (mut peer, _) = listener.accept().unwrap();
        let mut raw = CmMessage::new(CmOp::ConnResp, b"resp").to_bytes();
        raw.extend_from_slice(b"DATA-FRAME-BYTES");
        peer.write_all(&raw).unwrap();

        let event = step_until(&mut poll_loop, &eq);
        assert!(matches!(
            event,
            CmEvent::Connected { fid: got, ref data } if got == fid && data == b"resp"
        ));

        sock.set_nonblocking(false).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut trailing = [0u8; 16];
        (&*sock).read_exact(&mut trailing).unwrap();
        assert_eq!(&trailing, b"DATA-FRAME-BYTES");

        let mut req = [0u8; CmMessage::HEADER_LEN + 3];
        peer.read_exact(&mut req).unwrap();
        assert_eq!(CmMessage::parse(&req, 64).unwrap().unwrap().0.data(), b"req");
    }
}
