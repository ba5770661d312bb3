//! Error types for endpoint operations, ring buffer backpressure, and the
//! wire formats exchanged over a connection.

use std::{io, result};

use thiserror::Error;

/// Creates a [`crate::Error::Io`] with a custom message prefixed to the current
/// `errno` value.
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        let msg = format!("{prefix}: {errno}");
        $crate::Error::Io(::std::io::Error::new(errno.kind(), msg))
    }};
}
pub(crate) use errno;

/// A convenience wrapper around `Result` for [crate::Error].
pub type Result<T> = result::Result<T, Error>;

/// Set of errors returned synchronously by endpoint, fabric, and queue
/// operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// More memory regions than allowed for a single message.
    #[error("too many regions: {provided} (exceeds maximum allowed {max})")]
    TooManyRegions {
        /// Region count provided by the caller.
        provided: usize,
        /// Configured per-message region limit.
        max: usize,
    },
    /// Inline payload larger than the inject ceiling.
    #[error("inject payload too large: {provided} bytes (exceeds maximum allowed {max} bytes)")]
    InjectTooLarge {
        /// Payload length provided by the caller.
        provided: usize,
        /// Configured inject ceiling.
        max: usize,
    },
    /// Connection setup payload larger than the configured ceiling.
    #[error("connection data too large: {provided} bytes (exceeds maximum allowed {max} bytes)")]
    CmDataTooLarge {
        /// Payload length provided by the caller.
        provided: usize,
        /// Configured connection data ceiling.
        max: usize,
    },
    /// The receive descriptor pool is exhausted.
    #[error("receive descriptor pool exhausted ({capacity} descriptors in use)")]
    NoMem {
        /// Capacity of the exhausted pool.
        capacity: usize,
    },
    /// Not enough free space in the outbound ring buffer. Nothing was written;
    /// the identical call may be retried later.
    #[error("outbound ring full: {needed} bytes needed, {available} bytes available")]
    Again {
        /// Encoded size of the rejected frame.
        needed: usize,
        /// Free ring capacity at the time of the call.
        available: usize,
    },
    /// Inbound message arrived with no receive posted to match it. The
    /// message was left unconsumed.
    #[error("no receive posted")]
    NoPostedRecv,
    /// Underlying socket or system call failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Endpoint enabled without any completion queue bound.
    #[error("no completion queue bound to endpoint")]
    NoCompletionQueue,
    /// Connection management requested without an event queue bound.
    #[error("no event queue bound")]
    NoEventQueue,
    /// The fabric polling thread is no longer running.
    #[error("fabric polling thread has shut down")]
    Closed,
    /// Malformed frame or connection management message.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Broad category of an [Error], for callers that only care about how to
/// react to a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller bug, retrying will not help.
    Invalid,
    /// Resource pool exhausted, may be retried after backoff.
    NoMem,
    /// Ring buffer full, retry the identical call later.
    Again,
    /// System call failure.
    Io,
    /// Operation invoked before a required binding was made.
    NotReady,
}

impl Error {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_)
            | Error::TooManyRegions { .. }
            | Error::InjectTooLarge { .. }
            | Error::CmDataTooLarge { .. }
            | Error::Parse(_) => ErrorKind::Invalid,
            Error::NoMem { .. } => ErrorKind::NoMem,
            Error::Again { .. } | Error::NoPostedRecv => ErrorKind::Again,
            Error::Io(_) => ErrorKind::Io,
            Error::NoCompletionQueue | Error::NoEventQueue | Error::Closed => ErrorKind::NotReady,
        }
    }

    /// Returns the originating OS error code, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

/// Error occurred while decoding a frame or a connection management message.
#[derive(Debug, Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum ParseError {
    /// Input buffer shorter than the fixed header.
    #[error("invalid buffer length: {provided} bytes (less than the minimum {min} bytes)")]
    InvalidBufferLength { provided: usize, min: usize },
    /// Unknown frame op code.
    #[error("invalid op code: {0}")]
    InvalidOpcode(u8),
    /// Frame flags contain bits that neither end defines.
    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u64),
    /// Unsupported connection management version.
    #[error("invalid connection message version: {provided} (must be {expected})")]
    InvalidVersion { provided: u8, expected: u8 },
    /// Unknown connection management op.
    #[error("invalid connection message op: {0}")]
    InvalidCmOp(u8),
    /// Connection management payload larger than allowed.
    #[error(
        "invalid connection data length: {provided} bytes (exceeds maximum allowed {max} bytes)"
    )]
    InvalidCmDataLength { provided: usize, max: usize },
    /// Frame payload larger than the receiver accepts.
    #[error("invalid frame data length: {provided} bytes (exceeds maximum allowed {max} bytes)")]
    InvalidDataLength { provided: u64, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(
            Error::InjectTooLarge {
                provided: 65,
                max: 64
            }
            .kind(),
            ErrorKind::Invalid
        );
        assert_eq!(Error::NoMem { capacity: 1 }.kind(), ErrorKind::NoMem);
        assert_eq!(
            Error::Again {
                needed: 10,
                available: 2
            }
            .kind(),
            ErrorKind::Again
        );
        assert_eq!(Error::NoCompletionQueue.kind(), ErrorKind::NotReady);
        assert_eq!(
            Error::Io(io::Error::from_raw_os_error(libc::ECONNREFUSED)).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn io_error_keeps_os_code() {
        let err = Error::from(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
        assert_eq!(Error::Closed.raw_os_error(), None);
    }

    #[test]
    fn display_messages_carry_limits() {
        let err = Error::CmDataTooLarge {
            provided: 100,
            max: 56,
        };
        assert_eq!(
            err.to_string(),
            "connection data too large: 100 bytes (exceeds maximum allowed 56 bytes)"
        );
    }
}
