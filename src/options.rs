//! Contains the types needed to configure a connection pool.

use std::{fmt, time::Duration};

use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// The default bound on concurrent sockets per destination.
pub const DEFAULT_MAX_SOCKETS: u32 = 5;

/// An HTTP destination: the host/port pair connections are pooled by.
///
/// Two addresses are the same destination iff both fields are equal.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TargetAddress {
    /// The hostname of the destination.
    pub host: String,

    /// The port of the destination.
    pub port: u16,
}

impl TargetAddress {
    /// Creates a new address from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl<H: Into<String>> From<(H, u16)> for TargetAddress {
    fn from((host, port): (H, u16)) -> Self {
        Self::new(host, port)
    }
}

/// Options used to configure a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Clone, Debug, TypedBuilder)]
#[non_exhaustive]
pub struct PoolOptions {
    /// The maximum number of concurrent sockets per destination. This counts both established
    /// connections and in-flight connection attempts, and it must be greater than zero.
    ///
    /// The default is 5.
    #[builder(default = DEFAULT_MAX_SOCKETS)]
    pub max_sockets: u32,

    /// Whether connections are returned to the pool once a response completes. When this is
    /// false, every connection is closed at the end of its response.
    ///
    /// The default is true.
    #[builder(default = true)]
    pub keep_alive: bool,

    /// Whether several requests may be issued on one connection before their responses arrive.
    /// Pipelining requires `keep_alive`; requests made with pipelining enabled but keep-alive
    /// disabled are rejected through the caller's error handler.
    ///
    /// The default is false.
    #[builder(default = false)]
    pub pipelining: bool,

    /// The bound on parked acquires per destination. Once the bound is reached, further
    /// acquires are rejected immediately. A negative value leaves the wait queue unbounded.
    ///
    /// The default is -1 (unbounded).
    #[builder(default = -1)]
    pub max_wait_queue_size: i32,

    /// The time limit applied to each connection attempt. `None` uses the connector's default.
    #[builder(default)]
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PoolOptions {
    /// Validates the constraints that hold for the pool as a whole. The pipelining/keep-alive
    /// combination is deliberately not checked here: it is rejected per acquire, through the
    /// caller's error handler.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_sockets == 0 {
            return Err(Error::invalid_options("max_sockets must be greater than zero"));
        }
        Ok(())
    }
}
