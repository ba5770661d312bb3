//! Wire formats carried over the TCP byte stream.
//!
//! Data path messages are self-describing frames: a fixed header that tells
//! the consumer exactly how many bytes follow, then either inline payload or
//! region references. Connection setup uses a separate, smaller message
//! exchanged once per connection before any frame.

pub mod cm;
pub use cm::{CmMessage, CmOp};

pub mod frame;
pub use frame::{Frame, FrameHeader, IoRef, Op, Payload, SendFlags};
