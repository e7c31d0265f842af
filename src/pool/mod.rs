//! Connection pooling: a bounded set of persistent connections per destination, multiplexed
//! across many concurrent execution contexts.

mod conn;
mod establish;
mod queue;
#[cfg(test)]
mod test;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use derive_where::derive_where;
use tracing::debug;

pub use self::{
    conn::{AsyncIo, BoxedIo, Connection, ConnectionLifecycle},
    establish::{ConnectRequest, Connector, TcpConnector},
};
use self::queue::{AcquireOutcome, PerDestinationQueue, Waiter};
use crate::{
    context::Context,
    error::{Error, Result},
    options::{PoolOptions, TargetAddress},
};

/// Routes acquires to per-destination queues and owns the pool-wide configuration.
///
/// All state is kept behind an `Arc`: clones share one pool. Queues are created lazily on the
/// first request to a destination and dropped once their last connection closes with no one
/// waiting. The manager spawns connection attempts and context executors onto the current
/// tokio runtime, so it must be used from within one.
#[derive(Clone, Debug)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

#[derive_where(Debug)]
pub(crate) struct ManagerInner {
    options: PoolOptions,
    #[derive_where(skip)]
    connector: Arc<dyn Connector>,
    #[derive_where(skip)]
    queues: Mutex<QueueMap>,
}

#[derive(Default)]
struct QueueMap {
    entries: HashMap<TargetAddress, Arc<PerDestinationQueue>>,
    closed: bool,
}

impl ConnectionManager {
    /// Creates a manager that opens connections with the default [`TcpConnector`].
    pub fn new(options: PoolOptions) -> Result<Self> {
        Self::with_connector(options, Arc::new(TcpConnector))
    }

    /// Creates a manager that opens connections with `connector`.
    pub fn with_connector(options: PoolOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                options,
                connector,
                queues: Mutex::new(QueueMap::default()),
            }),
        })
    }

    /// The options this pool was configured with.
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Requests a connection to `host:port`.
    ///
    /// Exactly one of `on_ready` / `on_error` is eventually invoked, unless `cancel_probe`
    /// reports cancellation while the request is parked, in which case neither is and the
    /// request is discarded silently. `on_ready` always runs on `context`, even when the
    /// connection is handed over inside a lifecycle event; configuration and saturation errors
    /// invoke `on_error` synchronously on the calling thread.
    ///
    /// The probe is consulted lazily, only when the parked request reaches the head of the
    /// wait queue. It must be cheap and must not call back into the pool.
    pub fn get_connection<H, E, P>(
        &self,
        host: impl Into<String>,
        port: u16,
        on_ready: H,
        on_error: E,
        context: &Context,
        cancel_probe: P,
    ) where
        H: FnOnce(Connection) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
        P: Fn() -> bool + Send + 'static,
    {
        let options = &self.inner.options;
        if options.pipelining && !options.keep_alive {
            on_error(Error::invalid_options("pipelining requires keep-alive"));
            return;
        }
        let address = TargetAddress::new(host, port);
        let mut waiter = Waiter {
            handler: Box::new(on_ready),
            error_handler: Box::new(on_error),
            context: context.clone(),
            cancel_probe: Box::new(cancel_probe),
        };
        loop {
            let queue = match self.inner.queue_for(&address) {
                Some(queue) => queue,
                None => {
                    (waiter.error_handler)(Error::pool_closed("connection pool was closed"));
                    return;
                }
            };
            match queue.acquire(waiter) {
                AcquireOutcome::Handled => return,
                // Lost a race against the queue draining out of the map; adopt a fresh one.
                AcquireOutcome::Evicted(parked) => waiter = parked,
            }
        }
    }

    /// Acquires a connection as a future.
    ///
    /// Dropping the future cancels a parked acquire. A connection that is handed over after
    /// the future has already been dropped is closed, returning its slot to the pool.
    pub async fn acquire(
        &self,
        host: impl Into<String>,
        port: u16,
        context: &Context,
    ) -> Result<Connection> {
        let (sender, receiver) = tokio::sync::oneshot::channel::<Result<Connection>>();
        let sender = Arc::new(Mutex::new(Some(sender)));
        let ready_sender = Arc::clone(&sender);
        let error_sender = Arc::clone(&sender);
        let probe_sender = Arc::clone(&sender);
        self.get_connection(
            host,
            port,
            move |conn| {
                if let Some(sender) = ready_sender.lock().unwrap().take() {
                    if let Err(Ok(conn)) = sender.send(Ok(conn)) {
                        // The receiver was dropped between the cancel probe and delivery.
                        conn.close();
                    }
                }
            },
            move |error| {
                if let Some(sender) = error_sender.lock().unwrap().take() {
                    let _ = sender.send(Err(error));
                }
            },
            context,
            move || {
                probe_sender
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map_or(true, |sender| sender.is_closed())
            },
        );
        receiver
            .await
            .map_err(|_| Error::internal("acquire completed without a terminal event"))?
    }

    /// Closes the pool: every connection is closed, parked acquires fail with a shutdown
    /// error, and subsequent acquires are rejected. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    #[cfg(test)]
    pub(crate) fn queue(&self, address: &TargetAddress) -> Option<Arc<PerDestinationQueue>> {
        self.inner.queues.lock().unwrap().entries.get(address).cloned()
    }
}

impl ManagerInner {
    /// Resolves or creates the queue for `address`. Creation is a check-then-insert under the
    /// map lock; a racing creator's queue is adopted rather than replaced. An entry that has
    /// already drained (its deferred removal may still be in flight) is replaced with a fresh
    /// queue. Returns `None` once the pool has closed.
    fn queue_for(self: &Arc<Self>, address: &TargetAddress) -> Option<Arc<PerDestinationQueue>> {
        let mut map = self.queues.lock().unwrap();
        if map.closed {
            return None;
        }
        match map.entries.get(address) {
            Some(queue) if !queue.is_evicted() => return Some(Arc::clone(queue)),
            _ => {}
        }
        debug!(%address, "creating destination queue");
        let queue = PerDestinationQueue::new(
            address.clone(),
            self.options.clone(),
            Arc::clone(&self.connector),
            Arc::downgrade(self),
        );
        map.entries.insert(address.clone(), Arc::clone(&queue));
        Some(queue)
    }

    /// Adds a freshly established connection to `queue`, unless the pool has closed. Runs under
    /// the map lock so it cannot race `close`: once `close` returns, no connection can enter
    /// any queue.
    pub(crate) fn register_connection(
        &self,
        queue: &Arc<PerDestinationQueue>,
        conn: &Connection,
    ) -> bool {
        let map = self.queues.lock().unwrap();
        if map.closed {
            return false;
        }
        queue.add_connection(conn.clone());
        true
    }

    /// Drops `queue` from the map, provided it is still the registered entry for `address`.
    pub(crate) fn remove_queue(&self, address: &TargetAddress, queue: &PerDestinationQueue) {
        let mut map = self.queues.lock().unwrap();
        if let Some(entry) = map.entries.get(address) {
            if std::ptr::eq(Arc::as_ptr(entry), queue) {
                map.entries.remove(address);
            }
        }
    }

    fn close(&self) {
        let queues = {
            let mut map = self.queues.lock().unwrap();
            if map.closed {
                return;
            }
            map.closed = true;
            map.entries.drain().map(|(_, queue)| queue).collect::<Vec<_>>()
        };
        debug!(queues = queues.len(), "closing connection pool");
        for queue in queues {
            queue.close_all_connections();
        }
    }
}

impl Drop for ManagerInner {
    /// Cleanup for the last handle to a pool that was never explicitly closed.
    fn drop(&mut self) {
        let queues = {
            let mut map = self.queues.lock().unwrap();
            map.closed = true;
            map.entries.drain().map(|(_, queue)| queue).collect::<Vec<_>>()
        };
        for queue in queues {
            queue.close_all_connections();
        }
    }
}
