use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::Result;

/// Connection accepted on a listening socket, carried by a connection request
/// event until an endpoint adopts it.
#[derive(Debug)]
pub struct ConnHandle {
    sock: Socket,
    peer: Option<SocketAddr>,
}

impl ConnHandle {
    pub(crate) fn new(sock: Socket, peer: Option<SocketAddr>) -> Self {
        Self { sock, peer }
    }

    /// Address of the connecting peer, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn into_socket(self) -> Socket {
        self.sock
    }
}

/// Creates a TCP socket whose family matches `addr`, IPv4 when absent.
pub(crate) fn tcp_socket(addr: Option<SocketAddr>) -> Result<Socket> {
    let domain = match addr {
        Some(SocketAddr::V6(_)) => Domain::IPV6,
        _ => Domain::IPV4,
    };

    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    setup_socket(&sock)?;

    Ok(sock)
}

/// Applies the options every endpoint socket carries: address reuse and
/// disabled Nagle batching.
pub(crate) fn setup_socket(sock: &Socket) -> Result<()> {
    sock.set_reuse_address(true).inspect_err(|err| {
        warn!("failed to set SO_REUSEADDR: {err}");
    })?;

    sock.set_nodelay(true).inspect_err(|err| {
        warn!("failed to set TCP_NODELAY: {err}");
    })?;

    Ok(())
}
