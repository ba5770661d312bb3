use std::io;

use bitflags::bitflags;
use bytes::Bytes;

use crate::{Error, ParseError};

bitflags! {
    /// Per-message flags carried in every frame header.
    ///
    /// Both ends of a connection must agree on these bit assignments.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SendFlags: u64 {
        /// Payload bytes are copied inline after the header.
        const INJECT = 1 << 0;
        /// An 8-byte remote data field follows the header.
        const REMOTE_CQ_DATA = 1 << 1;
        /// No send completion is generated for this message.
        const NO_COMPLETION = 1 << 2;
    }
}

/// Operation carried by a frame.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    /// Two-sided message send, matched against a posted receive.
    MsgSend = 1,
}

impl TryFrom<u8> for Op {
    type Error = ParseError;

    fn try_from(op: u8) -> Result<Self, Self::Error> {
        match op {
            1 => Ok(Op::MsgSend),
            other => Err(ParseError::InvalidOpcode(other)),
        }
    }
}

/// Reference to a region of memory that stays owned by the sender until the
/// frame carrying it has been transmitted.
///
/// ```text
///    0                   1
///    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |    Address    |    Length     |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IoRef {
    /// Address of the first byte of the region.
    pub addr: u64,
    /// Length of the region in bytes.
    pub len: u64,
}

impl IoRef {
    /// Encoded length of a region reference in bytes.
    pub const LEN: usize = 16;

    /// Creates a reference describing the memory behind `buf`.
    pub fn of(buf: &Bytes) -> Self {
        Self {
            addr: buf.as_ptr() as u64,
            len: buf.len() as u64,
        }
    }

    /// Returns the little-endian encoding of the reference.
    pub fn to_le_bytes(&self) -> [u8; Self::LEN] {
        let mut raw = [0u8; Self::LEN];
        raw[..8].copy_from_slice(&self.addr.to_le_bytes());
        raw[8..].copy_from_slice(&self.len.to_le_bytes());
        raw
    }

    /// Decodes a reference from its little-endian encoding.
    pub fn from_le_bytes(raw: [u8; Self::LEN]) -> Self {
        let (addr, len) = raw.split_at(8);
        Self {
            addr: u64::from_le_bytes(read_u64(addr)),
            len: u64::from_le_bytes(read_u64(len)),
        }
    }
}

/// Payload of an outbound message.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// Bytes copied into the frame itself. The caller may reuse its buffers as
    /// soon as the frame has been written.
    Inline(&'a [&'a [u8]]),
    /// Only `(address, length)` references are written. The buffers must stay
    /// alive and unmodified until the frame has been transmitted.
    Deferred(&'a [Bytes]),
}

impl Payload<'_> {
    /// Number of regions making up the payload.
    pub fn region_count(&self) -> usize {
        match self {
            Payload::Inline(iov) => iov.len(),
            Payload::Deferred(iov) => iov.len(),
        }
    }

    /// Total number of payload bytes across all regions.
    pub fn data_len(&self) -> usize {
        match self {
            Payload::Inline(iov) => iov.iter().map(|region| region.len()).sum(),
            Payload::Deferred(iov) => iov.iter().map(Bytes::len).sum(),
        }
    }

    /// Returns `true` if the payload is copied inline.
    pub fn is_inline(&self) -> bool {
        matches!(self, Payload::Inline(_))
    }
}

/// Fixed part of every frame.
///
/// ```text
///    +--------+----------------+----------------+----------------+----------------+
///    |   Op   |  Region Count  |     Flags      |    Context     |  Data Length   |
///    | 1 byte |    8 bytes     |    8 bytes     |    8 bytes     |    8 bytes     |
///    +--------+----------------+----------------+----------------+----------------+
///    |  Remote Data (8 bytes, only if REMOTE_CQ_DATA is set)                      |
///    +-----------------------------------------------------------------------------+
///    |  INJECT:    `Data Length` payload bytes                                    |
///    |  otherwise: `Region Count` region references (16 bytes each)               |
///    +-----------------------------------------------------------------------------+
/// ```
///
/// All integers are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    op: Op,
    region_count: u64,
    flags: SendFlags,
    context: u64,
    data_len: u64,
    remote_data: u64,
}

impl FrameHeader {
    /// Length of the header without remote data.
    pub const MIN_HEADER_LEN: usize = 33;

    /// Length of the header including remote data.
    pub const MAX_HEADER_LEN: usize = Self::MIN_HEADER_LEN + 8;

    /// Creates a header. `remote_data` is only carried when `flags` contains
    /// [SendFlags::REMOTE_CQ_DATA].
    pub fn new(
        op: Op,
        flags: SendFlags,
        context: u64,
        region_count: u64,
        data_len: u64,
        remote_data: u64,
    ) -> Self {
        let remote_data = if flags.contains(SendFlags::REMOTE_CQ_DATA) {
            remote_data
        } else {
            0
        };

        Self {
            op,
            region_count,
            flags,
            context,
            data_len,
            remote_data,
        }
    }

    /// Returns the operation of the frame.
    pub fn op(&self) -> Op {
        self.op
    }

    /// Returns the number of regions the payload was gathered from.
    pub fn region_count(&self) -> u64 {
        self.region_count
    }

    /// Returns the message flags.
    pub fn flags(&self) -> SendFlags {
        self.flags
    }

    /// Returns the opaque completion context.
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Returns the total payload length in bytes.
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Returns the remote data, if carried.
    pub fn remote_data(&self) -> Option<u64> {
        self.flags
            .contains(SendFlags::REMOTE_CQ_DATA)
            .then_some(self.remote_data)
    }

    /// Returns `true` if the payload follows inline.
    pub fn is_inject(&self) -> bool {
        self.flags.contains(SendFlags::INJECT)
    }

    /// Length of the encoded header in bytes.
    pub fn header_len(&self) -> usize {
        if self.flags.contains(SendFlags::REMOTE_CQ_DATA) {
            Self::MAX_HEADER_LEN
        } else {
            Self::MIN_HEADER_LEN
        }
    }

    /// Length of whatever follows the header: the payload bytes for inject
    /// frames, the region references otherwise. Returns `None` if the length
    /// does not fit in memory.
    pub fn body_len(&self) -> Option<usize> {
        if self.is_inject() {
            usize::try_from(self.data_len).ok()
        } else {
            usize::try_from(self.region_count)
                .ok()?
                .checked_mul(IoRef::LEN)
        }
    }

    /// Total encoded length of the frame, if it fits in memory.
    pub fn frame_len(&self) -> Option<usize> {
        self.body_len()?.checked_add(self.header_len())
    }

    /// Returns the encoded header and the number of valid bytes in it.
    pub fn to_le_bytes(&self) -> ([u8; Self::MAX_HEADER_LEN], usize) {
        let mut raw = [0u8; Self::MAX_HEADER_LEN];

        raw[0] = self.op as u8;
        raw[1..9].copy_from_slice(&self.region_count.to_le_bytes());
        raw[9..17].copy_from_slice(&self.flags.bits().to_le_bytes());
        raw[17..25].copy_from_slice(&self.context.to_le_bytes());
        raw[25..33].copy_from_slice(&self.data_len.to_le_bytes());

        if self.flags.contains(SendFlags::REMOTE_CQ_DATA) {
            raw[33..41].copy_from_slice(&self.remote_data.to_le_bytes());
        }

        (raw, self.header_len())
    }

    /// Writes the header to the given output stream.
    pub fn write<T: io::Write>(&self, output: &mut T) -> crate::Result<()> {
        let (raw, nbytes) = self.to_le_bytes();
        output.write_all(&raw[..nbytes])?;

        Ok(())
    }

    /// Number of header bytes required to decode a header whose first
    /// [Self::MIN_HEADER_LEN] bytes are `raw`.
    pub fn required_len(raw: &[u8]) -> usize {
        if raw.len() < Self::MIN_HEADER_LEN {
            return Self::MIN_HEADER_LEN;
        }

        let flags = u64::from_le_bytes(read_u64(&raw[9..17]));
        if flags & SendFlags::REMOTE_CQ_DATA.bits() != 0 {
            Self::MAX_HEADER_LEN
        } else {
            Self::MIN_HEADER_LEN
        }
    }
}

impl TryFrom<&[u8]> for FrameHeader {
    type Error = Error;

    fn try_from(raw: &[u8]) -> Result<Self, Self::Error> {
        if raw.len() < Self::MIN_HEADER_LEN {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: raw.len(),
                min: Self::MIN_HEADER_LEN,
            }));
        }

        let op = Op::try_from(raw[0])?;
        let region_count = u64::from_le_bytes(read_u64(&raw[1..9]));
        let bits = u64::from_le_bytes(read_u64(&raw[9..17]));
        let flags = SendFlags::from_bits(bits).ok_or(ParseError::InvalidFlags(bits))?;
        let context = u64::from_le_bytes(read_u64(&raw[17..25]));
        let data_len = u64::from_le_bytes(read_u64(&raw[25..33]));

        let remote_data = if flags.contains(SendFlags::REMOTE_CQ_DATA) {
            if raw.len() < Self::MAX_HEADER_LEN {
                return Err(Error::Parse(ParseError::InvalidBufferLength {
                    provided: raw.len(),
                    min: Self::MAX_HEADER_LEN,
                }));
            }
            u64::from_le_bytes(read_u64(&raw[33..41]))
        } else {
            0
        };

        Ok(Self {
            op,
            region_count,
            flags,
            context,
            data_len,
            remote_data,
        })
    }
}

fn read_u64(raw: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[..8]);
    buf
}

/// A complete outbound frame: header plus payload.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    header: FrameHeader,
    payload: Payload<'a>,
}

impl<'a> Frame<'a> {
    /// Creates a message send frame. The [SendFlags::INJECT] bit is derived
    /// from the payload variant.
    pub fn new(mut flags: SendFlags, context: u64, remote_data: u64, payload: Payload<'a>) -> Self {
        flags.set(SendFlags::INJECT, payload.is_inline());

        let header = FrameHeader::new(
            Op::MsgSend,
            flags,
            context,
            payload.region_count() as u64,
            payload.data_len() as u64,
            remote_data,
        );

        Self { header, payload }
    }

    /// Returns the frame header.
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Returns the frame payload.
    pub fn payload(&self) -> &Payload<'a> {
        &self.payload
    }

    /// Total encoded length of the frame.
    pub fn encoded_len(&self) -> usize {
        let body_len = match self.payload {
            Payload::Inline(_) => self.payload.data_len(),
            Payload::Deferred(iov) => iov.len() * IoRef::LEN,
        };

        self.header.header_len() + body_len
    }

    /// Writes the complete frame to the given output stream.
    pub fn write<T: io::Write>(&self, output: &mut T) -> crate::Result<()> {
        self.header.write(output)?;

        match self.payload {
            Payload::Inline(iov) => {
                for region in iov {
                    output.write_all(region)?;
                }
            }
            Payload::Deferred(iov) => {
                for region in iov {
                    output.write_all(&IoRef::of(region).to_le_bytes())?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_inline_layout_exact() {
        let data: &[&[u8]] = &[b"abc", b"de"];
        let frame = Frame::new(SendFlags::empty(), 0x1122, 0, Payload::Inline(data));

        let mut buf = Vec::new();
        frame.write(&mut buf).unwrap();

        #[rustfmt::skip]
        let expected: Vec<u8> = [
            &[0x01u8][..],
            &[0x02, 0, 0, 0, 0, 0, 0, 0][..],
            &[0x01, 0, 0, 0, 0, 0, 0, 0][..],
            &[0x22, 0x11, 0, 0, 0, 0, 0, 0][..],
            &[0x05, 0, 0, 0, 0, 0, 0, 0][..],
            &b"abcde"[..],
        ]
        .concat();

        assert_eq!(buf, expected);
        assert_eq!(frame.encoded_len(), 38);
    }

    #[test]
    fn frame_remote_data_follows_header() {
        let data: &[&[u8]] = &[b"x"];
        let frame = Frame::new(
            SendFlags::REMOTE_CQ_DATA,
            7,
            0xdead_beef,
            Payload::Inline(data),
        );

        let mut buf = Vec::new();
        frame.write(&mut buf).unwrap();

        assert_eq!(buf.len(), FrameHeader::MAX_HEADER_LEN + 1);
        assert_eq!(
            &buf[33..41],
            &0xdead_beef_u64.to_le_bytes()[..],
            "remote data must sit directly after the fixed header"
        );
        assert_eq!(buf[41], b'x');

        let header = FrameHeader::try_from(&buf[..]).unwrap();
        assert_eq!(header.remote_data(), Some(0xdead_beef));
        assert_eq!(header.flags(), SendFlags::REMOTE_CQ_DATA | SendFlags::INJECT);
    }

    #[test]
    fn frame_deferred_carries_references_only() {
        let a = Bytes::from_static(b"hello");
        let b = Bytes::from(vec![0u8; 1000]);
        let iov = [a.clone(), b.clone()];

        let frame = Frame::new(SendFlags::INJECT, 3, 0, Payload::Deferred(&iov));
        assert!(!frame.header().is_inject());
        assert_eq!(frame.header().data_len(), 1005);
        assert_eq!(frame.encoded_len(), FrameHeader::MIN_HEADER_LEN + 2 * IoRef::LEN);

        let mut buf = Vec::new();
        frame.write(&mut buf).unwrap();
        assert_eq!(buf.len(), frame.encoded_len());

        let mut raw = [0u8; IoRef::LEN];
        raw.copy_from_slice(&buf[33..49]);
        assert_eq!(IoRef::from_le_bytes(raw), IoRef::of(&a));

        raw.copy_from_slice(&buf[49..65]);
        let second = IoRef::from_le_bytes(raw);
        assert_eq!(second.addr, b.as_ptr() as u64);
        assert_eq!(second.len, 1000);
    }

    #[test]
    fn frame_header_parse_invalid() {
        let data: &[&[u8]] = &[b"x"];
        let frame = Frame::new(SendFlags::empty(), 0, 0, Payload::Inline(data));
        let (mut raw, nbytes) = frame.header().to_le_bytes();

        assert!(matches!(
            FrameHeader::try_from(&raw[..nbytes - 1]),
            Err(Error::Parse(ParseError::InvalidBufferLength { .. }))
        ));

        raw[0] = 9;
        assert!(matches!(
            FrameHeader::try_from(&raw[..nbytes]),
            Err(Error::Parse(ParseError::InvalidOpcode(9)))
        ));

        raw[0] = Op::MsgSend as u8;
        raw[9] = 0x80;
        assert!(matches!(
            FrameHeader::try_from(&raw[..nbytes]),
            Err(Error::Parse(ParseError::InvalidFlags(_)))
        ));
    }

    #[test]
    fn frame_header_truncated_remote_data_invalid() {
        let data: &[&[u8]] = &[];
        let frame = Frame::new(SendFlags::REMOTE_CQ_DATA, 0, 1, Payload::Inline(data));
        let (raw, _) = frame.header().to_le_bytes();

        assert_eq!(
            FrameHeader::required_len(&raw[..FrameHeader::MIN_HEADER_LEN]),
            FrameHeader::MAX_HEADER_LEN
        );
        assert!(matches!(
            FrameHeader::try_from(&raw[..FrameHeader::MIN_HEADER_LEN]),
            Err(Error::Parse(ParseError::InvalidBufferLength { min: 41, .. }))
        ));
    }

    #[test]
    fn frame_header_body_len_overflow() {
        let header = FrameHeader::new(Op::MsgSend, SendFlags::empty(), 0, u64::MAX, 0, 0);
        assert_eq!(header.body_len(), None);
        assert_eq!(header.frame_len(), None);

        let header = FrameHeader::new(Op::MsgSend, SendFlags::INJECT, 0, 1, 5, 0);
        assert_eq!(header.body_len(), Some(5));
        assert_eq!(header.frame_len(), Some(FrameHeader::MIN_HEADER_LEN + 5));
    }

    #[test]
    fn frame_remote_data_ignored_without_flag() {
        let header = FrameHeader::new(Op::MsgSend, SendFlags::INJECT, 0, 0, 0, 42);
        assert_eq!(header.remote_data(), None);
        assert_eq!(header.header_len(), FrameHeader::MIN_HEADER_LEN);
    }
}
