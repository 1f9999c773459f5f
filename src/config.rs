//! Client-wide configuration value types: timeouts and pool limits.

use std::time::Duration;

/// Timeout configuration for the four phases of a request.
///
/// The four knobs are independent: `connect` bounds the TCP/TLS dial,
/// `read` and `write` bound individual stream operations, and `pool`
/// bounds how long a request may wait for a free pool slot.
///
/// `None` on any knob disables the timeout on that dimension. The default
/// is five seconds on all four.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use courier::Timeout;
///
/// // One duration for all four phases.
/// let all = Timeout::from(Duration::from_secs(10));
///
/// // Or tune each independently.
/// let tuned = Timeout::default()
///     .connect(Duration::from_secs(2))
///     .read(Duration::from_secs(30));
/// # drop((all, tuned));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub(crate) connect: Option<Duration>,
    pub(crate) read: Option<Duration>,
    pub(crate) write: Option<Duration>,
    pub(crate) pool: Option<Duration>,
}

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

impl Timeout {
    /// A configuration with no timeout on any dimension.
    pub fn none() -> Timeout {
        Timeout {
            connect: None,
            read: None,
            write: None,
            pool: None,
        }
    }

    /// Set the connect timeout.
    pub fn connect(mut self, dur: Duration) -> Timeout {
        self.connect = Some(dur);
        self
    }

    /// Disable the connect timeout.
    pub fn no_connect(mut self) -> Timeout {
        self.connect = None;
        self
    }

    /// Set the read timeout.
    pub fn read(mut self, dur: Duration) -> Timeout {
        self.read = Some(dur);
        self
    }

    /// Disable the read timeout.
    pub fn no_read(mut self) -> Timeout {
        self.read = None;
        self
    }

    /// Set the write timeout.
    pub fn write(mut self, dur: Duration) -> Timeout {
        self.write = Some(dur);
        self
    }

    /// Disable the write timeout.
    pub fn no_write(mut self) -> Timeout {
        self.write = None;
        self
    }

    /// Set the pool acquisition timeout.
    pub fn pool(mut self, dur: Duration) -> Timeout {
        self.pool = Some(dur);
        self
    }

    /// Disable the pool acquisition timeout.
    pub fn no_pool(mut self) -> Timeout {
        self.pool = None;
        self
    }
}

impl Default for Timeout {
    fn default() -> Timeout {
        Timeout {
            connect: Some(DEFAULT_TIMEOUT),
            read: Some(DEFAULT_TIMEOUT),
            write: Some(DEFAULT_TIMEOUT),
            pool: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl From<Duration> for Timeout {
    /// A bare duration sets all four knobs.
    fn from(dur: Duration) -> Timeout {
        Timeout {
            connect: Some(dur),
            read: Some(dur),
            write: Some(dur),
            pool: Some(dur),
        }
    }
}

/// Connection pool limits.
///
/// `max_connections` is a hard cap on concurrently open connections,
/// enforced with a semaphore. `max_keepalive` is a soft cap on idle
/// connections parked for reuse; excess idle connections are torn down
/// when released. `keepalive_expiry` bounds how long an idle connection
/// may wait before being evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub(crate) max_connections: usize,
    pub(crate) max_keepalive: usize,
    pub(crate) keepalive_expiry: Duration,
}

impl Limits {
    /// Set the hard cap on open connections.
    pub fn max_connections(mut self, max: usize) -> Limits {
        self.max_connections = max;
        self
    }

    /// Set the soft cap on idle keep-alive connections.
    pub fn max_keepalive_connections(mut self, max: usize) -> Limits {
        self.max_keepalive = max;
        self
    }

    /// Set how long an idle keep-alive connection may live.
    pub fn keepalive_expiry(mut self, dur: Duration) -> Limits {
        self.keepalive_expiry = dur;
        self
    }
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_connections: 100,
            max_keepalive: 20,
            keepalive_expiry: Duration::from_secs(5),
        }
    }
}
