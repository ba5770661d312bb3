//! Connection management messages exchanged right after the TCP handshake.
//!
//! The active side sends a request carrying its connection setup payload, the
//! passive side answers with a response carrying its own.

use crate::{Error, ParseError};

/// Version of the connection management message format.
pub const CM_VERSION: u8 = 1;

/// Kind of connection management message.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CmOp {
    /// Sent by the connecting side.
    ConnReq = 1,
    /// Sent by the accepting side.
    ConnResp = 2,
}

impl TryFrom<u8> for CmOp {
    type Error = ParseError;

    fn try_from(op: u8) -> Result<Self, Self::Error> {
        match op {
            1 => Ok(CmOp::ConnReq),
            2 => Ok(CmOp::ConnResp),
            other => Err(ParseError::InvalidCmOp(other)),
        }
    }
}

/// Connection management message.
///
/// ```text
///    +---------+---------+-------------------+-----------------------------+
///    | Version |   Op    |     Reserved      |        Data Length          |
///    | 1 byte  | 1 byte  |      2 bytes      |    4 bytes (little-endian)  |
///    +---------+---------+-------------------+-----------------------------+
///    |                  Connection setup payload ...                        |
///    +---------------------------------------------------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmMessage {
    op: CmOp,
    data: Vec<u8>,
}

impl CmMessage {
    /// Length of the fixed message header in bytes.
    pub const HEADER_LEN: usize = 8;

    /// Creates a new message carrying `data`.
    pub fn new(op: CmOp, data: &[u8]) -> Self {
        Self {
            op,
            data: data.to_vec(),
        }
    }

    /// Returns the message kind.
    pub fn op(&self) -> CmOp {
        self.op
    }

    /// Returns the connection setup payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message, returning its payload.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Returns the encoded message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_LEN + self.data.len());

        buf.push(CM_VERSION);
        buf.push(self.op as u8);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);

        buf
    }

    /// Number of bytes still missing from the start of `raw` before it holds a
    /// complete message. Returns `Ok(0)` once the message is complete; bytes
    /// past the message are never counted.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is malformed or advertises more than
    /// `max_data` bytes of payload.
    pub fn remaining(raw: &[u8], max_data: usize) -> Result<usize, Error> {
        if raw.len() < Self::HEADER_LEN {
            return Ok(Self::HEADER_LEN - raw.len());
        }

        let (_, len) = Self::parse_header(raw, max_data)?;
        Ok((Self::HEADER_LEN + len).saturating_sub(raw.len()))
    }

    /// Attempts to decode a message from the start of `raw`.
    ///
    /// Returns `Ok(None)` if `raw` does not yet hold a complete message, or the
    /// message and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is malformed or advertises more than
    /// `max_data` bytes of payload.
    pub fn parse(raw: &[u8], max_data: usize) -> Result<Option<(Self, usize)>, Error> {
        if raw.len() < Self::HEADER_LEN {
            return Ok(None);
        }

        let (op, len) = Self::parse_header(raw, max_data)?;

        let total = Self::HEADER_LEN + len;
        if raw.len() < total {
            return Ok(None);
        }

        Ok(Some((
            Self {
                op,
                data: raw[Self::HEADER_LEN..total].to_vec(),
            },
            total,
        )))
    }

    fn parse_header(raw: &[u8], max_data: usize) -> Result<(CmOp, usize), Error> {
        if raw[0] != CM_VERSION {
            return Err(Error::Parse(ParseError::InvalidVersion {
                provided: raw[0],
                expected: CM_VERSION,
            }));
        }

        let op = CmOp::try_from(raw[1])?;
        let len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;

        if len > max_data {
            return Err(Error::Parse(ParseError::InvalidCmDataLength {
                provided: len,
                max: max_data,
            }));
        }

        Ok((op, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cm_message_layout_valid() {
        let msg = CmMessage::new(CmOp::ConnReq, b"hi");
        assert_eq!(msg.to_bytes(), [1, 1, 0, 0, 2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn cm_message_parse_partial() {
        let raw = CmMessage::new(CmOp::ConnResp, b"payload").to_bytes();

        for cut in 0..raw.len() {
            assert!(CmMessage::parse(&raw[..cut], 256).unwrap().is_none());
        }

        let (msg, used) = CmMessage::parse(&raw, 256).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(msg.op(), CmOp::ConnResp);
        assert_eq!(msg.data(), b"payload");
    }

    #[test]
    fn cm_message_remaining_stops_at_message_end() {
        let mut raw = CmMessage::new(CmOp::ConnResp, b"resp").to_bytes();

        assert_eq!(CmMessage::remaining(&[], 256).unwrap(), 8);
        assert_eq!(CmMessage::remaining(&raw[..3], 256).unwrap(), 5);
        assert_eq!(CmMessage::remaining(&raw[..8], 256).unwrap(), 4);
        assert_eq!(CmMessage::remaining(&raw, 256).unwrap(), 0);

        raw.extend_from_slice(b"trailing");
        assert_eq!(CmMessage::remaining(&raw, 256).unwrap(), 0);
        assert!(CmMessage::remaining(&raw, 2).is_err());
    }

    #[test]
    fn cm_message_parse_invalid() {
        let mut raw = CmMessage::new(CmOp::ConnReq, &[0u8; 64]).to_bytes();

        assert!(matches!(
            CmMessage::parse(&raw, 56),
            Err(Error::Parse(ParseError::InvalidCmDataLength {
                provided: 64,
                max: 56
            }))
        ));

        raw[1] = 7;
        assert!(matches!(
            CmMessage::parse(&raw, 256),
            Err(Error::Parse(ParseError::InvalidCmOp(7)))
        ));

        raw[0] = 2;
        assert!(matches!(
            CmMessage::parse(&raw, 256),
            Err(Error::Parse(ParseError::InvalidVersion {
                provided: 2,
                expected: 1
            }))
        ));
    }
}
