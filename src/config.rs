//! Size ceilings and tunables shared by a fabric and everything opened under
//! it.

use std::time::Duration;

use crate::{Error, Result};

/// Maximum number of memory regions in a single message.
pub const DEFAULT_IOV_LIMIT: usize = 4;

/// Maximum payload, in bytes, that may be copied inline into the outbound
/// ring (inject sends).
pub const DEFAULT_MAX_INJECT_SIZE: usize = 64;

/// Maximum connection setup payload, in bytes, carried by connect/accept.
pub const DEFAULT_MAX_CM_DATA_SIZE: usize = 1 << 8;

/// Capacity, in bytes, of each endpoint's outbound ring buffer.
pub const DEFAULT_RING_SIZE: usize = 1 << 22;

/// Largest message payload, in bytes, the reference receive path accepts
/// from a peer.
pub const DEFAULT_MAX_MSG_SIZE: usize = 1 << 24;

/// Number of posted receive descriptors a domain can hand out at once.
pub const DEFAULT_RX_POOL_SIZE: usize = 1024;

/// Upper bound on a single `poll(2)` wait of the fabric polling thread. The
/// thread is woken earlier by its signal whenever work is submitted.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration of a fabric, inherited by its domains and endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of regions per send or receive.
    pub iov_limit: usize,
    /// Inline payload ceiling for inject sends.
    pub max_inject_size: usize,
    /// Connection setup payload ceiling.
    pub max_cm_data_size: usize,
    /// Ceiling on a received message payload.
    pub max_msg_size: usize,
    /// Outbound ring capacity per endpoint. Rounded up to a power of two.
    pub ring_size: usize,
    /// Receive descriptor pool size per domain.
    pub rx_pool_size: usize,
    /// Maximum time the polling thread blocks in a single wait.
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iov_limit: DEFAULT_IOV_LIMIT,
            max_inject_size: DEFAULT_MAX_INJECT_SIZE,
            max_cm_data_size: DEFAULT_MAX_CM_DATA_SIZE,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            ring_size: DEFAULT_RING_SIZE,
            rx_pool_size: DEFAULT_RX_POOL_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl Config {
    /// Sets the per-message region limit.
    pub fn with_iov_limit(mut self, iov_limit: usize) -> Self {
        self.iov_limit = iov_limit;
        self
    }

    /// Sets the inject payload ceiling.
    pub fn with_max_inject_size(mut self, max_inject_size: usize) -> Self {
        self.max_inject_size = max_inject_size;
        self
    }

    /// Sets the connection setup payload ceiling.
    pub fn with_max_cm_data_size(mut self, max_cm_data_size: usize) -> Self {
        self.max_cm_data_size = max_cm_data_size;
        self
    }

    /// Sets the received message payload ceiling.
    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Sets the outbound ring capacity.
    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    /// Sets the receive descriptor pool size.
    pub fn with_rx_pool_size(mut self, rx_pool_size: usize) -> Self {
        self.rx_pool_size = rx_pool_size;
        self
    }

    /// Sets the polling thread's maximum wait.
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Checks the configuration and normalizes the ring size to a power of
    /// two.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidArgument] if a limit is zero or the connection
    /// data ceiling does not fit the connection message length field.
    pub fn validate(mut self) -> Result<Self> {
        if self.iov_limit == 0 {
            return Err(Error::InvalidArgument("iov_limit must be non-zero"));
        }

        if self.ring_size == 0 {
            return Err(Error::InvalidArgument("ring_size must be non-zero"));
        }

        if self.rx_pool_size == 0 {
            return Err(Error::InvalidArgument("rx_pool_size must be non-zero"));
        }

        if self.max_cm_data_size > u32::MAX as usize {
            return Err(Error::InvalidArgument(
                "max_cm_data_size must fit in 32 bits",
            ));
        }

        self.ring_size = self
            .ring_size
            .checked_next_power_of_two()
            .ok_or(Error::InvalidArgument("ring_size is too large"))?;

        Ok(self)
    }
}
