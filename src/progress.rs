//! Reference progress engine.
//!
//! Moves committed frames from an endpoint's outbound ring onto a byte stream,
//! and matches frames read from a byte stream against posted receives. Deferred
//! frames are resolved here: their region references are replaced by the
//! pinned bytes, so every frame on the wire carries its payload inline.

use std::io::{Read, Write};

use tracing::{trace, warn};

use crate::net::Endpoint;
use crate::protocol::{Frame, FrameHeader, IoRef, Payload, SendFlags};
use crate::queue::{Completion, CompletionKind};
use crate::{Error, ParseError, Result};

/// Drains every committed frame of `ep` into `output`, posting a send
/// completion for each one that asked for it. Returns the number of messages
/// written.
///
/// Returns `Ok(0)` without writing if another thread is already draining the
/// ring.
///
/// `output` must block until each write completes. A socket left in
/// non-blocking mode by connection setup has to be switched back first,
/// otherwise a `WouldBlock` part-way through a frame fails the call.
///
/// # Errors
///
/// Returns an error if `output` fails or a deferred frame cannot be resolved.
/// The frame being written when the error occurred is lost.
pub fn transmit<W: Write>(ep: &Endpoint, output: &mut W) -> Result<usize> {
    let Some(mut reader) = ep.tx_ring().reader() else {
        return Ok(0);
    };

    let mut count = 0;
    let mut raw = [0u8; FrameHeader::MAX_HEADER_LEN];

    while reader.peek(&mut raw[..FrameHeader::MIN_HEADER_LEN]) == FrameHeader::MIN_HEADER_LEN {
        // Frames are committed whole, so the rest of the header and the body
        // are always readable here.
        let header_len = FrameHeader::required_len(&raw[..FrameHeader::MIN_HEADER_LEN]);
        reader.peek(&mut raw[..header_len]);
        let header = FrameHeader::try_from(&raw[..header_len])?;
        reader.consume(header_len);

        let body_len = header
            .body_len()
            .ok_or(Error::InvalidArgument("oversized frame in outbound ring"))?;
        let mut body = vec![0u8; body_len];
        if !reader.read_exact(&mut body) {
            return Err(Error::InvalidArgument("truncated frame in outbound ring"));
        }

        let payload = if header.is_inject() {
            body
        } else {
            let mut payload = Vec::with_capacity(header.data_len() as usize);

            for chunk in body.chunks_exact(IoRef::LEN) {
                let mut encoded = [0u8; IoRef::LEN];
                encoded.copy_from_slice(chunk);
                let ioref = IoRef::from_le_bytes(encoded);

                let region = ep
                    .take_pinned()
                    .ok_or(Error::InvalidArgument("deferred frame without pinned region"))?;
                if IoRef::of(&region) != ioref {
                    return Err(Error::InvalidArgument("pinned region does not match frame"));
                }

                payload.extend_from_slice(&region);
            }

            payload
        };

        let flags = header.flags();
        let remote_data = header.remote_data().unwrap_or(0);
        let iov = [payload.as_slice()];

        Frame::new(flags, header.context(), remote_data, Payload::Inline(&iov)).write(output)?;

        trace!("[{}] transmitted {} byte message", ep.fid(), payload.len());

        if !flags.contains(SendFlags::NO_COMPLETION) {
            if let Some(cq) = ep.tx_cq() {
                cq.push(Completion {
                    kind: CompletionKind::Send,
                    ep: ep.fid(),
                    context: header.context(),
                    len: payload.len(),
                    data: None,
                    buffers: Vec::new(),
                    overflow: 0,
                });
            }
        }

        count += 1;
    }

    Ok(count)
}

/// Places `data` into the oldest receive posted on `ep` and reports it on the
/// endpoint's receive completion queue. Bytes beyond the receive's capacity
/// are dropped and reported as overflow.
///
/// # Errors
///
/// Returns [Error::NoCompletionQueue] if no receive queue is bound, or
/// [Error::NoPostedRecv] if no receive is posted. Nothing is consumed on
/// error.
pub fn deliver(ep: &Endpoint, data: &[u8], remote_data: Option<u64>) -> Result<()> {
    let cq = ep.rx_cq().ok_or(Error::NoCompletionQueue)?;
    let rx = ep.take_posted_rx().ok_or(Error::NoPostedRecv)?;

    let context = rx.context();
    let (len, buffers) = rx.scatter(data);
    let overflow = data.len() - len;

    if overflow > 0 {
        warn!(
            "[{}] message truncated: {} bytes, {overflow} did not fit",
            ep.fid(),
            data.len()
        );
    }

    cq.push(Completion {
        kind: CompletionKind::Recv,
        ep: ep.fid(),
        context,
        len,
        data: remote_data,
        buffers,
        overflow,
    });

    Ok(())
}

/// Reads one frame from `input` and delivers it to `ep`.
///
/// `input` must block until each read completes, as with [transmit]; a
/// `WouldBlock` part-way through a frame leaves the stream desynchronized.
///
/// # Errors
///
/// Fails without reading if `ep` cannot take the message (see [deliver]).
/// Returns an error if `input` fails, the frame is malformed, or its payload
/// exceeds the configured `max_msg_size`.
pub fn receive<R: Read>(ep: &Endpoint, input: &mut R) -> Result<()> {
    if ep.rx_cq().is_none() {
        return Err(Error::NoCompletionQueue);
    }

    if ep.posted_rx() == 0 {
        return Err(Error::NoPostedRecv);
    }

    let mut raw = [0u8; FrameHeader::MAX_HEADER_LEN];
    input.read_exact(&mut raw[..FrameHeader::MIN_HEADER_LEN])?;

    let header_len = FrameHeader::required_len(&raw[..FrameHeader::MIN_HEADER_LEN]);
    input.read_exact(&mut raw[FrameHeader::MIN_HEADER_LEN..header_len])?;

    let header = FrameHeader::try_from(&raw[..header_len])?;
    if !header.is_inject() {
        return Err(Error::InvalidArgument("received frame without inline payload"));
    }

    let max = ep.domain().config().max_msg_size;
    let len = header
        .body_len()
        .filter(|&len| len <= max)
        .ok_or(Error::Parse(ParseError::InvalidDataLength {
            provided: header.data_len(),
            max,
        }))?;

    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload)?;

    trace!("[{}] received {} byte message", ep.fid(), payload.len());

    deliver(ep, &payload, header.remote_data())
}
