use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::mpsc;

use super::{
    conn::Connection,
    establish::{ConnectRequest, Connector},
    ConnectionManager,
};
use crate::{
    context::Context,
    error::{Error, ErrorKind},
    options::{PoolOptions, TargetAddress},
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Connector that records every attempt and either completes it immediately with a transport-
/// less connection or parks it for the test to complete by hand.
struct MockConnector {
    auto_complete: bool,
    connects: AtomicUsize,
    pending: Mutex<Vec<ConnectRequest>>,
}

impl MockConnector {
    fn auto() -> Arc<Self> {
        Arc::new(Self {
            auto_complete: true,
            connects: AtomicUsize::new(0),
            pending: Mutex::new(Vec::new()),
        })
    }

    fn manual() -> Arc<Self> {
        Arc::new(Self {
            auto_complete: false,
            connects: AtomicUsize::new(0),
            pending: Mutex::new(Vec::new()),
        })
    }

    fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn complete_next(&self) -> Connection {
        let request = self.pending.lock().unwrap().remove(0);
        let conn = Self::mock_connection(&request);
        request.complete(Ok(conn.clone()));
        conn
    }

    fn fail_next(&self, error: Error) {
        let request = self.pending.lock().unwrap().remove(0);
        request.complete(Err(error));
    }

    fn mock_connection(request: &ConnectRequest) -> Connection {
        Connection::new(
            request.address().clone(),
            request.context().clone(),
            Arc::clone(request.lifecycle()),
            None,
        )
    }
}

impl Connector for MockConnector {
    fn connect(&self, request: ConnectRequest) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.auto_complete {
            let conn = Self::mock_connection(&request);
            request.complete(Ok(conn));
        } else {
            self.pending.lock().unwrap().push(request);
        }
    }
}

fn manager_with(options: PoolOptions, connector: Arc<MockConnector>) -> ConnectionManager {
    ConnectionManager::with_connector(options, connector).unwrap()
}

/// Fires an acquire whose handlers forward into channels.
fn acquire_with_channels(
    manager: &ConnectionManager,
    host: &str,
    context: &Context,
) -> (
    mpsc::UnboundedReceiver<Connection>,
    mpsc::UnboundedReceiver<Error>,
) {
    let (conn_sender, conn_receiver) = mpsc::unbounded_channel();
    let (error_sender, error_receiver) = mpsc::unbounded_channel();
    manager.get_connection(
        host,
        80,
        move |conn| {
            let _ = conn_sender.send(conn);
        },
        move |error| {
            let _ = error_sender.send(error);
        },
        context,
        || false,
    );
    (conn_receiver, error_receiver)
}

async fn recv<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(EVENT_TIMEOUT, receiver.recv())
        .await
        .expect("timed out waiting for a pool event")
        .expect("event channel closed")
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for pool state"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn address(host: &str) -> TargetAddress {
    TargetAddress::new(host, 80)
}

#[tokio::test(flavor = "multi_thread")]
async fn cap_respected_under_burst() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder()
        .max_sockets(2)
        .max_wait_queue_size(10)
        .build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let (conn_sender, mut conn_receiver) = mpsc::unbounded_channel();
    for _ in 0..5 {
        let conn_sender = conn_sender.clone();
        manager.get_connection(
            "burst.test",
            80,
            move |conn| {
                let _ = conn_sender.send(conn);
            },
            |error| panic!("unexpected acquire error: {}", error),
            &context,
            || false,
        );
    }

    // Two connects satisfy the first two acquires; the other three park.
    assert_eq!(connector.connect_count(), 2);
    let queue = manager.queue(&address("burst.test")).unwrap();
    assert_eq!(queue.counts().2, 3);

    // Each completed response hands the freed connection to the next waiter in line.
    let mut served = Vec::new();
    for _ in 0..5 {
        let conn = recv(&mut conn_receiver).await;
        conn.begin_request();
        conn.end_response();
        served.push(conn);
    }

    assert_eq!(connector.connect_count(), 2);
    let (connection_count, _, waiters) = queue.counts();
    assert_eq!(connection_count, 2);
    assert_eq!(waiters, 0);
    for conn in &served {
        assert_eq!(conn.context(), &context);
    }
}

#[tokio::test]
async fn wait_queue_saturation_rejects_synchronously() {
    let connector = MockConnector::manual();
    let options = PoolOptions::builder()
        .max_sockets(1)
        .max_wait_queue_size(1)
        .build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let (_ready1, _err1) = acquire_with_channels(&manager, "busy.test", &context);
    let (_ready2, _err2) = acquire_with_channels(&manager, "busy.test", &context);

    // The first acquire holds the only attempt slot and the second fills the wait queue, so
    // the third is rejected before `get_connection` returns.
    let rejection = Arc::new(Mutex::new(None));
    let seen = rejection.clone();
    manager.get_connection(
        "busy.test",
        80,
        |_conn| panic!("saturated acquire should not be served"),
        move |error| {
            *seen.lock().unwrap() = Some(error);
        },
        &context,
        || false,
    );

    let error = rejection.lock().unwrap().take().expect("synchronous rejection");
    assert!(error.is_pool_too_busy());
    assert!(error.to_string().contains("max wait queue size of 1"));
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn affinity_evicts_idle_cross_context_connection() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder().max_sockets(1).build();
    let manager = manager_with(options, connector.clone());
    let context_one = Context::new();
    let context_two = Context::new();

    let (mut ready, _err) = acquire_with_channels(&manager, "affinity.test", &context_one);
    let first = recv(&mut ready).await;
    assert_eq!(first.context(), &context_one);
    first.begin_request();
    first.end_response();

    let queue = manager.queue(&address("affinity.test")).unwrap();
    wait_for(|| queue.counts().1 == 1).await;

    // A different context finds the idle connection unusable: it is closed and replaced.
    let (mut ready, _err) = acquire_with_channels(&manager, "affinity.test", &context_two);
    let second = recv(&mut ready).await;
    assert_eq!(second.context(), &context_two);
    assert_ne!(first, second);
    assert!(first.is_closed());
    assert_eq!(connector.connect_count(), 2);

    // Once the eviction's closed event lands, the count settles back at the cap.
    wait_for(|| queue.counts() == (1, 0, 0)).await;
}

#[tokio::test]
async fn cancelled_waiter_is_skipped_silently() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder().max_sockets(1).build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let (mut ready, _err) = acquire_with_channels(&manager, "cancel.test", &context);
    let conn = recv(&mut ready).await;
    conn.begin_request();

    let cancelled = Arc::new(AtomicBool::new(false));
    let handled = Arc::new(AtomicBool::new(false));
    let errored = Arc::new(AtomicBool::new(false));
    {
        let probe = cancelled.clone();
        let handled = handled.clone();
        let errored = errored.clone();
        manager.get_connection(
            "cancel.test",
            80,
            move |_conn| handled.store(true, Ordering::SeqCst),
            move |_error| errored.store(true, Ordering::SeqCst),
            &context,
            move || probe.load(Ordering::SeqCst),
        );
    }
    let (mut ready_b, _err_b) = acquire_with_channels(&manager, "cancel.test", &context);

    // Cancel the head waiter, then free the connection: the next waiter receives it.
    cancelled.store(true, Ordering::SeqCst);
    conn.end_response();

    let handed_over = recv(&mut ready_b).await;
    assert_eq!(handed_over, conn);
    assert!(!handled.load(Ordering::SeqCst));
    assert!(!errored.load(Ordering::SeqCst));
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn connect_failure_releases_capacity() {
    let connector = MockConnector::manual();
    let options = PoolOptions::builder().max_sockets(1).build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let (_ready1, mut err1) = acquire_with_channels(&manager, "flaky.test", &context);
    let (mut ready2, _err2) = acquire_with_channels(&manager, "flaky.test", &context);
    assert_eq!(connector.pending_count(), 1);

    connector.fail_next(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());

    // The failure surfaces to the acquire that triggered the attempt, and the freed slot
    // immediately starts an attempt for the parked waiter.
    let error = recv(&mut err1).await;
    assert!(matches!(*error.kind, ErrorKind::Io(_)));
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(connector.pending_count(), 1);

    let conn = connector.complete_next();
    let served = recv(&mut ready2).await;
    assert_eq!(served, conn);
}

#[tokio::test]
async fn pipelining_hands_over_after_request_ends() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder()
        .max_sockets(1)
        .pipelining(true)
        .build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let (mut ready, _err) = acquire_with_channels(&manager, "pipeline.test", &context);
    let conn = recv(&mut ready).await;
    conn.begin_request();

    let (mut ready2, _err2) = acquire_with_channels(&manager, "pipeline.test", &context);
    let queue = manager.queue(&address("pipeline.test")).unwrap();
    assert_eq!(queue.counts().2, 1);

    // The wire going idle is enough for a pipelined handoff; no response has ended yet.
    conn.end_request();
    let reused = recv(&mut ready2).await;
    assert_eq!(reused, conn);
    assert_eq!(connector.connect_count(), 1);

    // The connection only becomes idle once every outstanding response has ended.
    reused.begin_request();
    reused.end_response();
    assert_eq!(queue.counts().1, 0);
    reused.end_response();
    assert_eq!(queue.counts().1, 1);
}

#[tokio::test]
async fn request_ended_is_ignored_without_pipelining() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder().max_sockets(1).build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let (mut ready, _err) = acquire_with_channels(&manager, "plain.test", &context);
    let conn = recv(&mut ready).await;
    conn.begin_request();
    let (mut ready2, _err2) = acquire_with_channels(&manager, "plain.test", &context);

    // Between request-ended and response-ended the connection must stay busy.
    conn.end_request();
    let queue = manager.queue(&address("plain.test")).unwrap();
    assert_eq!(queue.counts(), (1, 0, 1));

    conn.end_response();
    let served = recv(&mut ready2).await;
    assert_eq!(served, conn);
}

#[tokio::test]
async fn connections_close_when_keep_alive_is_disabled() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder()
        .max_sockets(1)
        .keep_alive(false)
        .build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let (mut ready, _err) = acquire_with_channels(&manager, "oneshot.test", &context);
    let first = recv(&mut ready).await;
    first.begin_request();
    let (mut ready2, _err2) = acquire_with_channels(&manager, "oneshot.test", &context);

    first.end_response();
    assert!(first.is_closed());

    // The waiter is woken by the closed event, not by the response ending.
    let second = recv(&mut ready2).await;
    assert_ne!(second, first);
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn pipelining_without_keep_alive_is_rejected() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder()
        .pipelining(true)
        .keep_alive(false)
        .build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let rejection = Arc::new(Mutex::new(None));
    let seen = rejection.clone();
    manager.get_connection(
        "invalid.test",
        80,
        |_conn| panic!("invalid configuration should not be served"),
        move |error| {
            *seen.lock().unwrap() = Some(error);
        },
        &context,
        || false,
    );

    let error = rejection.lock().unwrap().take().expect("synchronous rejection");
    assert!(matches!(*error.kind, ErrorKind::InvalidOptions { .. }));
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn drained_queue_is_evicted_from_the_map() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder().max_sockets(2).build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let (mut ready, _err) = acquire_with_channels(&manager, "evict.test", &context);
    let conn = recv(&mut ready).await;
    assert!(manager.queue(&address("evict.test")).is_some());

    conn.close();
    wait_for(|| manager.queue(&address("evict.test")).is_none()).await;

    // A later acquire builds the destination back up from scratch.
    let (mut ready, _err) = acquire_with_channels(&manager, "evict.test", &context);
    let replacement = recv(&mut ready).await;
    assert_ne!(replacement, conn);
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn close_fails_waiters_and_rejects_new_acquires() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder().max_sockets(1).build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let (mut ready, _err) = acquire_with_channels(&manager, "close.test", &context);
    let conn = recv(&mut ready).await;
    conn.begin_request();
    let (_ready2, mut err2) = acquire_with_channels(&manager, "close.test", &context);

    manager.close();
    manager.close();

    assert!(conn.is_closed());
    let error = recv(&mut err2).await;
    assert!(error.is_pool_closed());

    let rejection = Arc::new(Mutex::new(None));
    let seen = rejection.clone();
    manager.get_connection(
        "close.test",
        80,
        |_conn| panic!("closed pool should not serve connections"),
        move |error| {
            *seen.lock().unwrap() = Some(error);
        },
        &context,
        || false,
    );
    let error = rejection.lock().unwrap().take().expect("synchronous rejection");
    assert!(error.is_pool_closed());
}

#[tokio::test]
async fn destinations_are_pooled_independently() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder().max_sockets(1).build();
    let manager = manager_with(options, connector.clone());
    let context = Context::new();

    let (mut ready_a, _err_a) = acquire_with_channels(&manager, "alpha.test", &context);
    let (mut ready_b, _err_b) = acquire_with_channels(&manager, "beta.test", &context);

    let conn_a = recv(&mut ready_a).await;
    let conn_b = recv(&mut ready_b).await;
    assert_eq!(conn_a.address(), &address("alpha.test"));
    assert_eq!(conn_b.address(), &address("beta.test"));
    assert_eq!(connector.connect_count(), 2);
    assert!(manager.queue(&address("alpha.test")).is_some());
    assert!(manager.queue(&address("beta.test")).is_some());
}

#[tokio::test]
async fn async_acquire_bridges_the_callback_surface() {
    let connector = MockConnector::auto();
    let manager = manager_with(PoolOptions::default(), connector.clone());
    let context = Context::new();

    let conn = manager.acquire("future.test", 80, &context).await.unwrap();
    assert_eq!(conn.context(), &context);

    manager.close();
    let error = manager.acquire("future.test", 80, &context).await.unwrap_err();
    assert!(error.is_pool_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_acquires_stay_within_the_cap() {
    let connector = MockConnector::auto();
    let options = PoolOptions::builder()
        .max_sockets(3)
        .max_wait_queue_size(-1)
        .build();
    let manager = manager_with(options, connector.clone());

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let manager = manager.clone();
        tasks.push(crate::runtime::spawn(async move {
            let context = Context::new();
            for _ in 0..5 {
                let conn = manager.acquire("storm.test", 80, &context).await.unwrap();
                conn.begin_request();
                tokio::task::yield_now().await;
                conn.end_response();
            }
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let queue = manager.queue(&address("storm.test")).unwrap();
    wait_for(|| {
        let (connection_count, _, waiters) = queue.counts();
        connection_count <= 3 && waiters == 0
    })
    .await;
}

#[tokio::test]
async fn tcp_connector_reaches_a_live_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = crate::runtime::spawn(async move { listener.accept().await.is_ok() });

    let manager = ConnectionManager::new(PoolOptions::default()).unwrap();
    let context = Context::new();
    let conn = manager.acquire("127.0.0.1", port, &context).await.unwrap();

    assert!(accepted.await.unwrap());
    assert!(conn.take_io().is_some());
    assert!(conn.take_io().is_none());

    manager.close();
    wait_for(|| conn.is_closed()).await;
}
