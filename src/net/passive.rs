//! Passive endpoint: a listening socket reporting connection requests.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{SockAddr, Socket};
use tracing::{debug, warn};

use crate::fabric::{Fabric, Fid};
use crate::net::poll_mgr::PollEntry;
use crate::net::socket;
use crate::queue::EventQueue;
use crate::{Error, Result};

/// Listening endpoint. Each incoming connection surfaces as a connection
/// request event carrying a [crate::net::ConnHandle].
#[derive(Debug)]
pub struct PassiveEndpoint {
    fid: Fid,
    fabric: Fabric,
    sock: Arc<Socket>,
    local_addr: SocketAddr,
    eq: Option<Arc<EventQueue>>,
    listening: bool,
}

impl PassiveEndpoint {
    pub(crate) fn open(fabric: &Fabric, src_addr: Option<SocketAddr>) -> Result<Self> {
        let addr = src_addr.unwrap_or(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));

        let sock = socket::tcp_socket(Some(addr))?;
        sock.bind(&SockAddr::from(addr)).inspect_err(|err| {
            warn!("failed to bind listener to {addr}: {err}");
        })?;

        let local_addr = sock
            .local_addr()?
            .as_socket()
            .ok_or(Error::InvalidArgument("listener bound to a non-IP address"))?;

        let fid = Fid::next();
        debug!("[{fid}] passive endpoint bound to {local_addr}");

        Ok(Self {
            fid,
            fabric: fabric.clone(),
            sock: Arc::new(sock),
            local_addr,
            eq: None,
            listening: false,
        })
    }

    /// Identifier reported in this endpoint's connection request events.
    pub fn fid(&self) -> Fid {
        self.fid
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Binds the queue connection requests are reported to.
    pub fn bind_eq(&mut self, eq: &Arc<EventQueue>) {
        self.eq = Some(Arc::clone(eq));
    }

    /// Starts listening and hands the socket to the polling thread.
    ///
    /// # Errors
    ///
    /// Returns [Error::NoEventQueue] if no event queue is bound,
    /// [Error::InvalidArgument] if already listening, or an I/O error if the
    /// socket could not listen.
    pub fn listen(&mut self) -> Result<()> {
        let eq = self.eq.clone().ok_or(Error::NoEventQueue)?;

        if self.listening {
            return Err(Error::InvalidArgument("passive endpoint already listening"));
        }

        self.sock.listen(libc::SOMAXCONN).inspect_err(|err| {
            warn!("[{}] failed to listen: {err}", self.fid);
        })?;
        self.sock.set_nonblocking(true)?;

        self.fabric
            .poll_manager()
            .insert(PollEntry::passive(self.fid, Arc::clone(&self.sock), eq))?;
        self.listening = true;

        debug!("[{}] listening on {}", self.fid, self.local_addr);

        Ok(())
    }

    /// Returns `true` once [PassiveEndpoint::listen] has succeeded.
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Stops listening and closes the socket. Returns only after the polling
    /// thread has released every reference to it.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for PassiveEndpoint {
    fn drop(&mut self) {
        self.fabric.poll_manager().remove(self.fid);

        debug!("[{}] passive endpoint closed", self.fid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::net::TcpListener;

    #[test]
    fn passive_ep_binds_ephemeral_loopback() {
        let fabric = Fabric::open(Config::default()).unwrap();
        let pep = fabric.passive_ep(None).unwrap();

        assert_eq!(pep.local_addr().ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(pep.local_addr().port(), 0);
    }

    #[test]
    fn passive_ep_listen_requires_eq() {
        let fabric = Fabric::open(Config::default()).unwrap();
        let mut pep = fabric.passive_ep(None).unwrap();

        assert!(matches!(pep.listen(), Err(Error::NoEventQueue)));
        assert!(!pep.is_listening());

        pep.bind_eq(&Arc::new(EventQueue::new()));
        pep.listen().unwrap();
        assert!(matches!(pep.listen(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn passive_ep_close_releases_port() {
        let fabric = Fabric::open(Config::default()).unwrap();
        let eq = Arc::new(EventQueue::new());

        for _ in 0..32 {
            let mut pep = fabric.passive_ep(None).unwrap();
            pep.bind_eq(&eq);
            pep.listen().unwrap();

            let addr = pep.local_addr();
            pep.close();

            // The polling thread no longer holds the socket open.
            assert!(TcpListener::bind(addr).is_ok());
        }
    }
}
