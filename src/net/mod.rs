//! Connection-oriented endpoints over TCP sockets.
//!
//! Data transfer is non-blocking and reported through completion queues;
//! connection setup and teardown are driven by the fabric's polling thread and
//! reported through event queues.

mod endpoint;
mod event_loop;
mod passive;
mod poll_mgr;
mod socket;

pub use endpoint::{BindFlags, Endpoint, EndpointInfo, SendMsg};
pub use event_loop::PollLoop;
pub use passive::PassiveEndpoint;
pub use poll_mgr::{PollEntry, PollKind, PollManager, PollState};
pub use socket::ConnHandle;
