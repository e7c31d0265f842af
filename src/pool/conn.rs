use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};

use derive_where::derive_where;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{context::Context, options::TargetAddress};

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// The transport a connection carries: any async byte stream the protocol codec can drive.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// A boxed transport, as produced by a [`Connector`](crate::Connector).
pub type BoxedIo = Box<dyn AsyncIo>;

/// The interface through which the protocol codec reports request lifecycle transitions back
/// into the pool.
///
/// Implemented by the per-destination queue. Connectors receive the listener in their
/// [`ConnectRequest`](crate::ConnectRequest) and store it on the connections they produce; the
/// codec then raises these events via the corresponding [`Connection`] methods.
pub trait ConnectionLifecycle: Send + Sync + 'static {
    /// The request bytes for one exchange have been fully written.
    fn request_ended(&self, conn: Connection);

    /// The response body for one exchange has been delivered to the application.
    fn response_ended(&self, conn: Connection);

    /// The socket is gone (`Some`), or a connection attempt failed (`None`).
    fn connection_closed(&self, conn: Option<Connection>);
}

/// A pooled connection handle.
///
/// A connection is owned by exactly one per-destination queue for its lifetime and is
/// permanently bound to the execution context it was created on. Cloning the handle does not
/// clone the underlying socket, and equality is handle identity.
#[derive(Clone, Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive_where(Debug)]
struct ConnectionInner {
    id: u32,
    address: TargetAddress,
    context: Context,
    closed: AtomicBool,
    outstanding_requests: AtomicU32,
    #[derive_where(skip)]
    lifecycle: Arc<dyn ConnectionLifecycle>,
    #[derive_where(skip)]
    io: Mutex<Option<BoxedIo>>,
}

impl Connection {
    /// Creates a connection bound to `context` that reports lifecycle transitions through
    /// `lifecycle`.
    ///
    /// `io` is the transport the protocol codec will drive; connectors used only in tests may
    /// pass `None`.
    pub fn new(
        address: TargetAddress,
        context: Context,
        lifecycle: Arc<dyn ConnectionLifecycle>,
        io: Option<BoxedIo>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                address,
                context,
                closed: AtomicBool::new(false),
                outstanding_requests: AtomicU32::new(0),
                lifecycle,
                io: Mutex::new(io),
            }),
        }
    }

    /// The pool-assigned id of this connection.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// The destination this connection is bound to.
    pub fn address(&self) -> &TargetAddress {
        &self.inner.address
    }

    /// The execution context this connection was created on. Never changes.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Whether this connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The number of requests currently in flight on this connection. Increases when a request
    /// starts and decreases when its response ends; only ever above 1 under pipelining.
    pub fn outstanding_request_count(&self) -> u32 {
        self.inner.outstanding_requests.load(Ordering::SeqCst)
    }

    /// Claims the transport so the codec can drive it. Returns `None` if the transport was
    /// already claimed, was never present, or was released by [`close`](Self::close).
    pub fn take_io(&self) -> Option<BoxedIo> {
        self.inner.io.lock().unwrap().take()
    }

    /// Marks the start of a request on this connection. Invoked by the codec when it begins
    /// writing request bytes.
    pub fn begin_request(&self) {
        self.inner.outstanding_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Reports that the request bytes for one exchange have been fully written. Invoked by the
    /// codec on this connection's context.
    pub fn end_request(&self) {
        self.inner.lifecycle.request_ended(self.clone());
    }

    /// Reports that a full response has been delivered to the application. Decrements the
    /// outstanding-request count before notifying the pool. Invoked by the codec on this
    /// connection's context.
    pub fn end_response(&self) {
        let _ = self
            .inner
            .outstanding_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.inner.lifecycle.response_ended(self.clone());
    }

    /// Closes the connection. The transport is released immediately; the pool observes the
    /// closed event asynchronously on this connection's context. Idempotent.
    ///
    /// The event must not be raised inline: queues close connections while holding their own
    /// lock, and the closed event re-enters it.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.io.lock().unwrap().take();
        let conn = self.clone();
        self.inner.context.execute(move || {
            let lifecycle = Arc::clone(&conn.inner.lifecycle);
            lifecycle.connection_closed(Some(conn));
        });
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}
