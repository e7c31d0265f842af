use std::{sync::Arc, time::Duration};

use derive_where::derive_where;
use tracing::{debug, warn};

use super::conn::{Connection, ConnectionLifecycle};
use crate::{
    context::Context,
    error::Result,
    options::TargetAddress,
    runtime::{self, stream},
};

/// A request to open one connection, as handed to a [`Connector`].
///
/// Every request must be completed exactly once. Completing with an error releases the capacity
/// slot the pool reserved for the attempt by raising `connection_closed(None)` on the lifecycle
/// listener; connector implementations must not raise that event themselves for failed
/// attempts.
#[derive_where(Debug)]
pub struct ConnectRequest {
    address: TargetAddress,
    context: Context,
    connect_timeout: Option<Duration>,
    #[derive_where(skip)]
    lifecycle: Arc<dyn ConnectionLifecycle>,
    #[derive_where(skip)]
    handler: Box<dyn FnOnce(Result<Connection>) + Send>,
}

impl ConnectRequest {
    pub(crate) fn new(
        address: TargetAddress,
        context: Context,
        connect_timeout: Option<Duration>,
        lifecycle: Arc<dyn ConnectionLifecycle>,
        handler: Box<dyn FnOnce(Result<Connection>) + Send>,
    ) -> Self {
        Self {
            address,
            context,
            connect_timeout,
            lifecycle,
            handler,
        }
    }

    /// The destination to connect to.
    pub fn address(&self) -> &TargetAddress {
        &self.address
    }

    /// The execution context the new connection must be bound to.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The connect timeout configured on the pool, if any.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// The lifecycle listener the new connection must report through.
    pub fn lifecycle(&self) -> &Arc<dyn ConnectionLifecycle> {
        &self.lifecycle
    }

    /// Completes the attempt with a ready connection or the reason it failed.
    pub fn complete(self, result: Result<Connection>) {
        match result {
            Ok(conn) => (self.handler)(Ok(conn)),
            Err(error) => {
                warn!(address = %self.address, %error, "connection attempt failed");
                // Release the reserved slot before surfacing the error, so the next waiter can
                // start its own attempt.
                self.lifecycle.connection_closed(None);
                (self.handler)(Err(error));
            }
        }
    }
}

/// Opens transport-level connections on demand.
///
/// `connect` must not block; the attempt proceeds in the background and completes its
/// [`ConnectRequest`] exactly once. The produced connection must be bound to the request's
/// context and report through the request's lifecycle listener.
pub trait Connector: Send + Sync + 'static {
    /// Begins establishing a connection for `request`.
    fn connect(&self, request: ConnectRequest);
}

/// The default connector: plain TCP with `TCP_NODELAY` set, honoring the pool's connect
/// timeout. Resolved socket addresses are attempted in sequence.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, request: ConnectRequest) {
        runtime::spawn(async move {
            let result = stream::connect_tcp(request.address(), request.connect_timeout())
                .await
                .map(|tcp| {
                    debug!(address = %request.address(), "opened connection");
                    Connection::new(
                        request.address().clone(),
                        request.context().clone(),
                        Arc::clone(request.lifecycle()),
                        Some(Box::new(tcp)),
                    )
                });
            request.complete(result);
        });
    }
}
