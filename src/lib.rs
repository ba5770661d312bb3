//! Message-passing endpoints carried over TCP byte streams, in user-space.
//!
//! A [Fabric] owns a polling thread that drives connection setup and teardown.
//! Endpoints opened from a [Domain] connect to or accept peers asynchronously,
//! reporting the outcome on an [EventQueue]. Sends encode a self-describing
//! frame into a per-endpoint ring buffer and return immediately; receives post
//! descriptors matched in order against inbound messages. Completions are
//! reported on [CompletionQueue]s.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("This crate is only compatible with Linux systems that support eventfd.");

pub mod config;
pub mod error;
pub mod fabric;
pub mod net;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod ring;
pub mod rx;
pub mod signal;

pub use config::Config;
pub(crate) use error::errno;
pub use error::{Error, ErrorKind, ParseError, Result};
pub use fabric::{Domain, Fabric, Fid};
pub use net::{BindFlags, ConnHandle, Endpoint, EndpointInfo, PassiveEndpoint, SendMsg};
pub use protocol::SendFlags;
pub use queue::{CmEvent, Completion, CompletionKind, CompletionQueue, EventQueue};
pub use rx::RecvMsg;
