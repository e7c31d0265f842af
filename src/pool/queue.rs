use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, Weak},
};

use tracing::{debug, warn};

use super::{
    conn::{Connection, ConnectionLifecycle},
    establish::{ConnectRequest, Connector},
    ManagerInner,
};
use crate::{
    context::Context,
    error::Error,
    options::{PoolOptions, TargetAddress},
};

/// A parked acquire: the caller's handlers, its context, and the cancellation probe that is
/// consulted once the waiter reaches the head of the queue.
pub(crate) struct Waiter {
    pub(crate) handler: Box<dyn FnOnce(Connection) + Send>,
    pub(crate) error_handler: Box<dyn FnOnce(Error) + Send>,
    pub(crate) context: Context,
    pub(crate) cancel_probe: Box<dyn Fn() -> bool + Send>,
}

impl Waiter {
    fn cancelled(&self) -> bool {
        (self.cancel_probe)()
    }

    fn fail(self, error: Error) {
        let error_handler = self.error_handler;
        self.context.execute(move || error_handler(error));
    }
}

/// Deferred work produced inside the queue's critical section and executed once the lock has
/// been released. User handlers never run under the lock.
enum Action {
    Deliver(Waiter, Connection),
    Connect(Waiter),
    Reject(Waiter, Error),
}

/// The outcome of an acquire attempt against one queue.
pub(crate) enum AcquireOutcome {
    /// The waiter was served, parked, or rejected.
    Handled,
    /// The queue was drained and dropped from the manager's map before the waiter got in; the
    /// caller should retry against a fresh queue.
    Evicted(Waiter),
}

/// The pool state machine for a single destination.
///
/// Every method is serialized by the queue's mutex. The queue owns all open connections to its
/// address, the subset that is idle, and the deque of parked acquires; it enforces the socket
/// cap, the wait-queue bound, and context affinity.
pub(crate) struct PerDestinationQueue {
    address: TargetAddress,
    options: PoolOptions,
    connector: Arc<dyn Connector>,
    manager: Weak<ManagerInner>,
    weak_self: Weak<PerDestinationQueue>,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    /// Every open connection to this destination, available or in use.
    all_connections: Vec<Connection>,

    /// Idle connections, oldest at the head.
    available_connections: VecDeque<Connection>,

    /// Parked acquires, FIFO modulo lazy cancellation harvesting and affinity deferral.
    waiters: VecDeque<Waiter>,

    /// Established connections plus in-flight attempts. Transiently overshoots the cap while an
    /// affinity-evicted connection's closed event is pending, and settles back under it.
    connection_count: u32,

    /// Set once the queue has been dropped from the manager's map. Stale handles observe the
    /// flag and retry against a fresh queue.
    evicted: bool,
}

impl PerDestinationQueue {
    pub(crate) fn new(
        address: TargetAddress,
        options: PoolOptions,
        connector: Arc<dyn Connector>,
        manager: Weak<ManagerInner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            address,
            options,
            connector,
            manager,
            weak_self: weak_self.clone(),
            state: Mutex::new(QueueState::default()),
        })
    }

    /// Serves, parks, or rejects one acquire.
    pub(crate) fn acquire(&self, waiter: Waiter) -> AcquireOutcome {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.evicted {
                return AcquireOutcome::Evicted(waiter);
            }
            self.acquire_locked(&mut state, waiter, &mut actions);
        }
        self.run_actions(actions);
        AcquireOutcome::Handled
    }

    /// The acquire algorithm, on already-locked state. Also the target of the re-entry from
    /// `response_ended`, which calls it as a tail step under the same lock acquisition.
    fn acquire_locked(&self, state: &mut QueueState, waiter: Waiter, actions: &mut Vec<Action>) {
        // Same-context fast path: the head of the idle list.
        let mut candidate = match state.available_connections.front() {
            Some(head) if head.context() == &waiter.context => {
                state.available_connections.pop_front()
            }
            _ => None,
        };

        // Same-context scan over the remaining idle connections.
        if candidate.is_none() {
            if let Some(idx) = state
                .available_connections
                .iter()
                .position(|conn| conn.context() == &waiter.context)
            {
                candidate = state.available_connections.remove(idx);
            }
        }

        if let Some(conn) = candidate {
            if !conn.is_closed() {
                actions.push(Action::Deliver(waiter, conn));
                return;
            }
            // A dead idle connection: it has already left the idle list, and its slot is
            // reclaimed when its closed event lands. Treat it as never found.
        }

        if state.available_connections.is_empty()
            && state.connection_count >= self.options.max_sockets
        {
            let bound = self.options.max_wait_queue_size;
            if bound < 0 || state.waiters.len() < bound as usize {
                state.waiters.push_back(waiter);
            } else {
                warn!(
                    address = %self.address,
                    max_wait_queue_size = bound,
                    "wait queue saturated"
                );
                actions.push(Action::Reject(waiter, Error::pool_too_busy(bound)));
            }
            return;
        }

        // Either below the cap, or an idle connection exists on the wrong context. Affinity
        // wins over raw reuse: drop the oldest idle connection and open a fresh one on the
        // caller's context. The close completes asynchronously, so the new attempt is counted
        // eagerly to keep the cap enforced across the handover.
        if let Some(stale) = state.available_connections.pop_front() {
            debug!(
                address = %self.address,
                id = stale.id(),
                "closing idle connection bound to another context"
            );
            stale.close();
        }
        state.connection_count += 1;
        actions.push(Action::Connect(waiter));
    }

    /// Pops the next live waiter, harvesting cancelled ones. With a required context, a
    /// non-matching head is pushed back and none is returned: a peek-with-skip, not a scan, so
    /// waiters stay FIFO.
    fn next_waiter(waiters: &mut VecDeque<Waiter>, matching: Option<&Context>) -> Option<Waiter> {
        while let Some(waiter) = waiters.pop_front() {
            if waiter.cancelled() {
                continue;
            }
            match matching {
                Some(context) if waiter.context != *context => {
                    waiters.push_front(waiter);
                    return None;
                }
                _ => return Some(waiter),
            }
        }
        None
    }

    fn run_actions(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Deliver(waiter, conn) => Self::deliver(waiter, conn),
                Action::Connect(waiter) => self.spawn_connect(waiter),
                // Rejections are part of the synchronous error surface and run on the calling
                // thread.
                Action::Reject(waiter, error) => (waiter.error_handler)(error),
            }
        }
    }

    /// Schedules the ready handler on the waiter's context. Handlers always run there, even
    /// when the connection was handed off inside a lifecycle callback.
    fn deliver(waiter: Waiter, conn: Connection) {
        let handler = waiter.handler;
        waiter.context.execute(move || handler(conn));
    }

    /// Starts a connection attempt on behalf of `waiter`. The slot was already reserved by the
    /// caller under the lock.
    fn spawn_connect(&self, waiter: Waiter) {
        let Some(queue) = self.weak_self.upgrade() else {
            waiter.fail(Error::pool_closed("connection pool was closed"));
            return;
        };
        let lifecycle: Arc<dyn ConnectionLifecycle> = queue.clone();
        let request = ConnectRequest::new(
            self.address.clone(),
            waiter.context.clone(),
            self.options.connect_timeout,
            lifecycle,
            Box::new(move |result| match result {
                Ok(conn) => queue.connection_established(waiter, conn),
                // The slot was already released through `connection_closed(None)`; surface the
                // failure to the exact waiter whose acquire triggered the attempt.
                Err(error) => waiter.fail(error),
            }),
        );
        self.connector.connect(request);
    }

    /// A connector produced a live connection for `waiter`. Registration goes through the
    /// manager's lock so it cannot race `ConnectionManager::close`.
    fn connection_established(self: Arc<Self>, waiter: Waiter, conn: Connection) {
        let registered = match self.manager.upgrade() {
            Some(manager) => manager.register_connection(&self, &conn),
            None => false,
        };
        if !registered {
            // The pool shut down while the attempt was in flight. Closing the connection
            // releases its slot through the usual closed event.
            conn.close();
            waiter.fail(Error::pool_closed("connection pool was closed"));
            return;
        }
        debug!(address = %self.address, id = conn.id(), "connection established");
        Self::deliver(waiter, conn);
    }

    /// Adds a registered connection to the owned set. Called with the manager's lock held.
    pub(crate) fn add_connection(&self, conn: Connection) {
        self.state.lock().unwrap().all_connections.push(conn);
    }

    /// Whether this queue has drained and left the manager's map.
    pub(crate) fn is_evicted(&self) -> bool {
        self.state.lock().unwrap().evicted
    }

    /// Closes every connection and fails every parked waiter. Connections are closed outside
    /// the lock: their closed events re-enter it.
    pub(crate) fn close_all_connections(&self) {
        let (connections, waiters) = {
            let mut state = self.state.lock().unwrap();
            state.evicted = true;
            state.available_connections.clear();
            (
                std::mem::take(&mut state.all_connections),
                std::mem::take(&mut state.waiters),
            )
        };
        debug!(
            address = %self.address,
            connections = connections.len(),
            waiters = waiters.len(),
            "closing all connections"
        );
        for conn in connections {
            conn.close();
        }
        for waiter in waiters {
            waiter.fail(Error::pool_closed("connection pool was closed"));
        }
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (u32, usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.connection_count,
            state.available_connections.len(),
            state.waiters.len(),
        )
    }
}

impl ConnectionLifecycle for PerDestinationQueue {
    fn request_ended(&self, conn: Connection) {
        // Pipelining hands the in-flight socket to the next same-context waiter without
        // waiting for the response; with pipelining off the connection stays busy until
        // `response_ended`.
        if !self.options.pipelining {
            return;
        }
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(waiter) = Self::next_waiter(&mut state.waiters, Some(conn.context())) {
                actions.push(Action::Deliver(waiter, conn));
            }
        }
        self.run_actions(actions);
    }

    fn response_ended(&self, conn: Connection) {
        if !self.options.pipelining && !self.options.keep_alive {
            // The waiter wake for this slot rides the closed event, keeping the count
            // accounting in one place.
            conn.close();
            return;
        }
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(waiter) = Self::next_waiter(&mut state.waiters, Some(conn.context())) {
                actions.push(Action::Deliver(waiter, conn));
            } else if !self.options.pipelining || conn.outstanding_request_count() == 0 {
                state.available_connections.push_back(conn);
                // Serve the oldest waiter regardless of context; acquire hands it the freed
                // connection or replaces it with a fresh one on the waiter's own context.
                if let Some(waiter) = Self::next_waiter(&mut state.waiters, None) {
                    self.acquire_locked(&mut state, waiter, &mut actions);
                }
            }
        }
        self.run_actions(actions);
    }

    fn connection_closed(&self, conn: Option<Connection>) {
        let mut actions = Vec::new();
        let mut evict = false;
        {
            let mut state = self.state.lock().unwrap();
            state.connection_count = state.connection_count.saturating_sub(1);
            if let Some(ref conn) = conn {
                state.all_connections.retain(|c| c != conn);
                state.available_connections.retain(|c| c != conn);
            }

            // Only hand the freed slot onward while genuinely under the cap; an overshoot from
            // an affinity eviction still has closed events in flight that will get here.
            let served = if state.connection_count < self.options.max_sockets {
                Self::next_waiter(&mut state.waiters, None)
            } else {
                None
            };
            match served {
                Some(waiter) => {
                    // Waiters only park when nothing was available, so the slot becomes a
                    // fresh attempt rather than a scan of the idle list.
                    state.connection_count += 1;
                    actions.push(Action::Connect(waiter));
                }
                None => {
                    if state.connection_count == 0 && state.waiters.is_empty() && !state.evicted {
                        state.evicted = true;
                        evict = true;
                    }
                }
            }
        }
        if evict {
            debug!(address = %self.address, "destination drained; dropping queue");
            if let Some(manager) = self.manager.upgrade() {
                manager.remove_queue(&self.address, self);
            }
        }
        self.run_actions(actions);
    }
}
