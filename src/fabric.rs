//! Fabric and domain: the shared context every endpoint is created from.
//!
//! A [Fabric] owns the polling thread that drives connection setup for all of
//! its endpoints. A [Domain] owns the resources shared by the endpoints opened
//! from it: the receive descriptor pool and the progress signal raised on every
//! successful send.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::config::Config;
use crate::net::{Endpoint, EndpointInfo, PassiveEndpoint, PollLoop, PollManager};
use crate::rx::RxPool;
use crate::signal::Signal;
use crate::Result;

/// Identifier of an endpoint or passive endpoint, unique within the process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fid(u64);

impl Fid {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fid:{}", self.0)
    }
}

/// Top-level handle owning the connection polling thread.
///
/// Cloning is cheap; the polling thread stops once the last clone, and every
/// domain and passive endpoint created from it, is dropped.
#[derive(Debug, Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

#[derive(Debug)]
struct FabricInner {
    config: Config,
    poll_mgr: Arc<PollManager>,
    poll_thread: Option<JoinHandle<()>>,
}

impl Fabric {
    /// Validates `config` and starts the polling thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or if the wake signal
    /// or the polling thread could not be created.
    pub fn open(config: Config) -> Result<Self> {
        let config = config.validate()?;

        let poll_mgr = Arc::new(PollManager::new()?);
        let poll_loop = PollLoop::new(Arc::clone(&poll_mgr), config.max_cm_data_size);
        let timeout = config.poll_timeout;

        let poll_thread = thread::Builder::new()
            .name("tcpx-poll".into())
            .spawn(move || {
                if let Err(err) = poll_loop.run(timeout) {
                    error!("polling thread failed: {err}");
                }
            })?;

        info!(
            "fabric opened (ring_size: {}, rx_pool_size: {}, max_inject_size: {})",
            config.ring_size, config.rx_pool_size, config.max_inject_size
        );

        Ok(Self {
            inner: Arc::new(FabricInner {
                config,
                poll_mgr,
                poll_thread: Some(poll_thread),
            }),
        })
    }

    /// Validated configuration of the fabric.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Work queue of the polling thread.
    pub fn poll_manager(&self) -> &PollManager {
        &self.inner.poll_mgr
    }

    /// Opens a domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain's progress signal could not be created.
    pub fn domain(&self) -> Result<Domain> {
        Domain::open(self)
    }

    /// Opens a passive endpoint bound to `src_addr`, or to an ephemeral
    /// loopback port when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listening socket could not be created or bound.
    pub fn passive_ep(&self, src_addr: Option<SocketAddr>) -> Result<PassiveEndpoint> {
        PassiveEndpoint::open(self, src_addr)
    }
}

impl Drop for FabricInner {
    fn drop(&mut self) {
        self.poll_mgr.shutdown();

        if let Some(handle) = self.poll_thread.take() {
            if handle.join().is_err() {
                error!("polling thread panicked");
            }
        }

        debug!("fabric closed");
    }
}

/// Resource domain shared by a set of endpoints.
#[derive(Debug, Clone)]
pub struct Domain {
    inner: Arc<DomainInner>,
}

#[derive(Debug)]
struct DomainInner {
    fabric: Fabric,
    rx_pool: RxPool,
    progress: Signal,
}

impl Domain {
    fn open(fabric: &Fabric) -> Result<Self> {
        let rx_pool = RxPool::with_capacity(fabric.config().rx_pool_size);

        Ok(Self {
            inner: Arc::new(DomainInner {
                fabric: fabric.clone(),
                rx_pool,
                progress: Signal::new()?,
            }),
        })
    }

    /// Fabric the domain was opened from.
    pub fn fabric(&self) -> &Fabric {
        &self.inner.fabric
    }

    /// Configuration inherited from the fabric.
    pub fn config(&self) -> &Config {
        self.inner.fabric.config()
    }

    /// Pool every posted receive of the domain's endpoints is allocated from.
    pub fn rx_pool(&self) -> &RxPool {
        &self.inner.rx_pool
    }

    /// Wakes whoever drives data progress for this domain.
    pub fn signal_progress(&self) {
        self.inner.progress.set();
    }

    /// Signal raised once per successful send.
    pub fn progress_signal(&self) -> &Signal {
        &self.inner.progress
    }

    /// Opens an active endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint's socket could not be created.
    pub fn endpoint(&self, info: EndpointInfo) -> Result<Endpoint> {
        Endpoint::open(self, info)
    }
}
