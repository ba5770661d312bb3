//! Active endpoint: one TCP connection carrying framed messages.
//!
//! Sends never touch the socket. Each one encodes a single frame into the
//! endpoint's outbound ring and raises the domain's progress signal; the
//! progress engine later drains the ring onto the wire. Receives only record
//! a descriptor for the progress engine to fill.

use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{SockAddr, Socket};
use tracing::{debug, trace, warn};

use crate::fabric::{Domain, Fid};
use crate::net::poll_mgr::PollEntry;
use crate::net::socket::{self, ConnHandle};
use crate::protocol::{Frame, Payload, SendFlags};
use crate::queue::{CompletionQueue, EventQueue};
use crate::ring::RingBuffer;
use crate::rx::{PostedRx, RecvMsg, RxKey};
use crate::{Error, Result};

bitflags! {
    /// Directions a completion queue is bound for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindFlags: u64 {
        /// Send completions.
        const TRANSMIT = 1 << 0;
        /// Receive completions.
        const RECV = 1 << 1;
    }
}

/// Attributes an endpoint is opened with.
#[derive(Debug, Default)]
pub struct EndpointInfo {
    /// Local address; only selects the address family.
    pub src_addr: Option<SocketAddr>,
    /// Remote address; only selects the address family.
    pub dest_addr: Option<SocketAddr>,
    /// Connection taken from a connection request, to be accepted.
    pub handle: Option<ConnHandle>,
}

impl EndpointInfo {
    /// Attributes for an endpoint adopting the connection behind `handle`.
    pub fn with_handle(handle: ConnHandle) -> Self {
        Self {
            handle: Some(handle),
            ..Default::default()
        }
    }
}

/// Regions and metadata of an outbound message.
#[derive(Debug, Default, Clone)]
pub struct SendMsg {
    /// Payload regions, sent in order.
    pub iov: Vec<Bytes>,
    /// Opaque value reported back in the send completion.
    pub context: u64,
    /// Remote data, carried when [SendFlags::REMOTE_CQ_DATA] is set.
    pub data: u64,
}

/// Connected message endpoint.
#[derive(Debug)]
pub struct Endpoint {
    fid: Fid,
    domain: Domain,
    conn: Arc<Socket>,
    adopted: bool,
    tx_ring: RingBuffer,
    /// Regions of deferred frames, in ring order, kept alive until the frame
    /// referencing them is transmitted.
    pinned: Mutex<VecDeque<Bytes>>,
    posted_rx: Mutex<VecDeque<RxKey>>,
    tx_cq: Option<Arc<CompletionQueue>>,
    rx_cq: Option<Arc<CompletionQueue>>,
    eq: Option<Arc<EventQueue>>,
    enabled: bool,
    registered: AtomicBool,
}

impl Endpoint {
    pub(crate) fn open(domain: &Domain, info: EndpointInfo) -> Result<Self> {
        let (conn, adopted) = match info.handle {
            Some(handle) => {
                let sock = handle.into_socket();
                socket::setup_socket(&sock)?;
                (sock, true)
            }
            None => (socket::tcp_socket(info.src_addr.or(info.dest_addr))?, false),
        };

        let fid = Fid::next();
        debug!("[{fid}] endpoint opened (adopted: {adopted})");

        Ok(Self {
            fid,
            domain: domain.clone(),
            conn: Arc::new(conn),
            adopted,
            tx_ring: RingBuffer::with_capacity(domain.config().ring_size),
            pinned: Mutex::new(VecDeque::new()),
            posted_rx: Mutex::new(VecDeque::new()),
            tx_cq: None,
            rx_cq: None,
            eq: None,
            enabled: false,
            registered: AtomicBool::new(false),
        })
    }

    /// Identifier reported in this endpoint's events and completions.
    pub fn fid(&self) -> Fid {
        self.fid
    }

    /// Domain the endpoint was opened from.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Underlying connection socket.
    pub fn socket(&self) -> &Socket {
        &self.conn
    }

    /// Binds `cq` for the directions in `flags`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidArgument] if `flags` names no direction.
    pub fn bind_cq(&mut self, cq: &Arc<CompletionQueue>, flags: BindFlags) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArgument("no completion direction given"));
        }

        if flags.contains(BindFlags::TRANSMIT) {
            self.tx_cq = Some(Arc::clone(cq));
        }

        if flags.contains(BindFlags::RECV) {
            self.rx_cq = Some(Arc::clone(cq));
        }

        Ok(())
    }

    /// Binds the queue connection events are reported to.
    pub fn bind_eq(&mut self, eq: &Arc<EventQueue>) {
        self.eq = Some(Arc::clone(eq));
    }

    /// Marks the endpoint ready for use.
    ///
    /// # Errors
    ///
    /// Returns [Error::NoCompletionQueue] if no completion queue is bound.
    pub fn enable(&mut self) -> Result<()> {
        if self.tx_cq.is_none() && self.rx_cq.is_none() {
            return Err(Error::NoCompletionQueue);
        }

        self.enabled = true;
        debug!("[{}] enabled", self.fid);

        Ok(())
    }

    /// Returns `true` once [Endpoint::enable] has succeeded.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Starts connecting to `addr`, sending `param` as connection setup data.
    /// Completion is reported as a connected or error event.
    ///
    /// # Errors
    ///
    /// Returns [Error::CmDataTooLarge] if `param` exceeds the configured
    /// ceiling, [Error::NoEventQueue] if no event queue is bound, or an I/O
    /// error if the connect could not be issued. Nothing is queued on error.
    pub fn connect(&self, addr: SocketAddr, param: &[u8]) -> Result<()> {
        let eq = self.checked_cm(param)?;

        self.conn.set_nonblocking(true)?;
        match self.conn.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) => {
                warn!("[{}] failed to connect to {addr}: {err}", self.fid);
                return Err(err.into());
            }
        }

        debug!("[{}] connecting to {addr}", self.fid);

        self.register(PollEntry::connect(self.fid, Arc::clone(&self.conn), eq, param))
    }

    /// Accepts the connection this endpoint adopted from a connection request,
    /// answering with `param`. Completion is reported as a connected or error
    /// event.
    ///
    /// # Errors
    ///
    /// Returns [Error::CmDataTooLarge] if `param` exceeds the configured
    /// ceiling, [Error::NoEventQueue] if no event queue is bound, or
    /// [Error::InvalidArgument] if the endpoint was not opened from a
    /// connection request.
    pub fn accept(&self, param: &[u8]) -> Result<()> {
        let eq = self.checked_cm(param)?;

        if !self.adopted {
            return Err(Error::InvalidArgument(
                "accept requires an endpoint opened from a connection request",
            ));
        }

        self.conn.set_nonblocking(true)?;

        debug!("[{}] accepting connection", self.fid);

        self.register(PollEntry::accept(self.fid, Arc::clone(&self.conn), eq, param))
    }

    fn checked_cm(&self, param: &[u8]) -> Result<Arc<EventQueue>> {
        let max = self.domain.config().max_cm_data_size;
        if param.len() > max {
            return Err(Error::CmDataTooLarge {
                provided: param.len(),
                max,
            });
        }

        self.eq.clone().ok_or(Error::NoEventQueue)
    }

    fn register(&self, entry: PollEntry) -> Result<()> {
        self.domain.fabric().poll_manager().insert(entry)?;
        self.registered.store(true, Ordering::Release);

        Ok(())
    }

    /// Sends `msg`. With [SendFlags::INJECT] the payload is copied into the
    /// ring; otherwise the regions are held until transmitted.
    ///
    /// # Errors
    ///
    /// Returns [Error::TooManyRegions] or [Error::InjectTooLarge] for invalid
    /// messages, and [Error::Again] if the ring cannot take the frame right
    /// now. Nothing is written on error.
    pub fn sendmsg(&self, msg: &SendMsg, flags: SendFlags) -> Result<()> {
        if flags.contains(SendFlags::INJECT) {
            let iov: Vec<&[u8]> = msg.iov.iter().map(Bytes::as_ref).collect();
            self.send_inline(&iov, flags, msg.context, msg.data)
        } else {
            self.send_deferred(&msg.iov, flags, msg.context, msg.data)
        }
    }

    /// Sends a single region, reporting `context` on completion.
    pub fn send(&self, buf: Bytes, context: u64) -> Result<()> {
        self.send_deferred(&[buf], SendFlags::empty(), context, 0)
    }

    /// Sends several regions as one message.
    pub fn sendv(&self, iov: &[Bytes], context: u64) -> Result<()> {
        self.send_deferred(iov, SendFlags::empty(), context, 0)
    }

    /// Sends a single region carrying remote data `data`.
    pub fn senddata(&self, buf: Bytes, data: u64, context: u64) -> Result<()> {
        self.send_deferred(&[buf], SendFlags::REMOTE_CQ_DATA, context, data)
    }

    /// Copies `buf` inline. `buf` may be reused immediately and no send
    /// completion is generated.
    pub fn inject(&self, buf: &[u8]) -> Result<()> {
        self.send_inline(&[buf], SendFlags::NO_COMPLETION, 0, 0)
    }

    /// Copies `buf` inline with remote data `data`, without a send completion.
    pub fn injectdata(&self, buf: &[u8], data: u64) -> Result<()> {
        self.send_inline(
            &[buf],
            SendFlags::NO_COMPLETION | SendFlags::REMOTE_CQ_DATA,
            0,
            data,
        )
    }

    fn send_inline(&self, iov: &[&[u8]], flags: SendFlags, context: u64, data: u64) -> Result<()> {
        self.check_regions(iov.len())?;

        let max = self.domain.config().max_inject_size;
        let len: usize = iov.iter().map(|region| region.len()).sum();
        if len > max {
            return Err(Error::InjectTooLarge { provided: len, max });
        }

        self.submit(Frame::new(flags, context, data, Payload::Inline(iov)), &[])
    }

    fn send_deferred(
        &self,
        iov: &[Bytes],
        flags: SendFlags,
        context: u64,
        data: u64,
    ) -> Result<()> {
        self.check_regions(iov.len())?;

        self.submit(Frame::new(flags, context, data, Payload::Deferred(iov)), iov)
    }

    fn check_regions(&self, count: usize) -> Result<()> {
        let max = self.domain.config().iov_limit;
        if count > max {
            return Err(Error::TooManyRegions {
                provided: count,
                max,
            });
        }

        Ok(())
    }

    /// Writes `frame` to the ring as one unit and pins `regions` for the
    /// progress engine.
    fn submit(&self, frame: Frame<'_>, regions: &[Bytes]) -> Result<()> {
        let needed = frame.encoded_len();

        {
            let mut writer = self.tx_ring.writer();

            let available = writer.avail();
            if needed > available {
                trace!("[{}] ring full ({needed} > {available})", self.fid);
                return Err(Error::Again { needed, available });
            }

            frame.write(&mut writer)?;

            // Pins are queued before the frame is published so the consumer
            // always finds them.
            if !regions.is_empty() {
                self.pinned.lock().extend(regions.iter().cloned());
            }

            writer.commit();
        }

        trace!("[{}] queued {needed} byte frame", self.fid);
        self.domain.signal_progress();

        Ok(())
    }

    /// Posts `msg` to receive the next unmatched inbound message.
    ///
    /// # Errors
    ///
    /// Returns [Error::TooManyRegions] if `msg` has more regions than allowed,
    /// or [Error::NoMem] if the domain's descriptor pool is exhausted.
    pub fn recvmsg(&self, msg: RecvMsg, flags: u64) -> Result<()> {
        self.check_regions(msg.iov.len())?;

        let key = self
            .domain
            .rx_pool()
            .alloc(PostedRx::new(self.fid, msg, flags))?;
        self.posted_rx.lock().push_back(key);

        Ok(())
    }

    /// Posts a single-region receive.
    pub fn recv(&self, buf: BytesMut, context: u64) -> Result<()> {
        self.recvmsg(RecvMsg::new(buf, context), 0)
    }

    /// Posts a multi-region receive.
    pub fn recvv(&self, iov: Vec<BytesMut>, context: u64) -> Result<()> {
        self.recvmsg(RecvMsg { iov, context }, 0)
    }

    /// Outbound ring drained by the progress engine.
    pub fn tx_ring(&self) -> &RingBuffer {
        &self.tx_ring
    }

    /// Takes the oldest pinned region, to resolve a deferred frame.
    pub fn take_pinned(&self) -> Option<Bytes> {
        self.pinned.lock().pop_front()
    }

    /// Takes the oldest posted receive.
    pub fn take_posted_rx(&self) -> Option<PostedRx> {
        let key = self.posted_rx.lock().pop_front()?;
        self.domain.rx_pool().free(key)
    }

    /// Number of receives posted and not yet matched.
    pub fn posted_rx(&self) -> usize {
        self.posted_rx.lock().len()
    }

    /// Queue bound for send completions.
    pub fn tx_cq(&self) -> Option<&Arc<CompletionQueue>> {
        self.tx_cq.as_ref()
    }

    /// Queue bound for receive completions.
    pub fn rx_cq(&self) -> Option<&Arc<CompletionQueue>> {
        self.rx_cq.as_ref()
    }

    /// Closes the endpoint: removes it from the polling thread, returns its
    /// posted receives to the pool and closes the socket.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.registered.load(Ordering::Acquire) {
            self.domain.fabric().poll_manager().remove(self.fid);
        }

        let keys = mem::take(&mut *self.posted_rx.lock());
        for key in keys {
            self.domain.rx_pool().free(key);
        }

        self.pinned.lock().clear();

        debug!("[{}] endpoint closed", self.fid);
    }
}
