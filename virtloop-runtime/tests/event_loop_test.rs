//! Integration tests for the event loop bridge.
//!
//! These tests drive the registrar and runner through the mock driver.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;
use virtloop_runtime::{
    Connection, DomainEventType, EntityKind, EventLoopRunner, EventNotification, EventPayload,
    EventRegistrar, HandleEvents, LoopState, MockDriver, RawEntityEvent, RunnerOptions,
    StoragePoolEventType, VirtDriver,
};

const KNOWN_DOMAIN: &str = "11111111-1111-1111-1111-111111111111";

fn test_options() -> RunnerOptions {
    RunnerOptions {
        join_timeout: Duration::from_secs(5),
        liveness_poll: Duration::from_millis(10),
        thread_name: "virtloop-it".to_string(),
    }
}

fn setup() -> (Arc<MockDriver>, Arc<EventRegistrar>, Arc<Connection>) {
    let driver = Arc::new(MockDriver::new());
    let registrar = EventRegistrar::new();
    registrar.install(driver.as_ref()).expect("install event impl");

    let dyn_driver: Arc<dyn VirtDriver> = driver.clone();
    let conn = Connection::open(dyn_driver, "mock:///default").expect("open connection");
    (driver, registrar, conn)
}

fn collect(conn: &Connection, domain: Uuid) -> mpsc::Receiver<EventNotification> {
    let (tx, rx) = mpsc::channel();
    conn.subscribe_domain(domain, move |n| {
        let _ = tx.send(n.clone());
    });
    rx
}

/// Native registers its transport descriptor, the descriptor becomes
/// readable, and the lifecycle event read from it reaches the subscriber.
#[test]
fn test_end_to_end_handle_dispatch() {
    let (driver, registrar, conn) = setup();
    let domain = Uuid::parse_str(KNOWN_DOMAIN).unwrap();
    let rx = collect(&conn, domain);

    let runner = EventLoopRunner::start(&conn, test_options()).unwrap();

    let watch = driver.simulate_add_handle(5, HandleEvents::READABLE);
    assert_eq!(watch, 0);
    let state = registrar.handle_watch().unwrap();
    assert_eq!(state.fd, 5);
    assert_eq!(state.events, HandleEvents::READABLE);

    // Started / restored
    driver.queue_inbound(RawEntityEvent::new(
        domain.as_bytes().as_slice(),
        DomainEventType::Started.as_raw(),
        2,
    ));
    driver.simulate_handle_ready(HandleEvents::READABLE);

    let event = rx.recv_timeout(Duration::from_secs(5)).expect("notification");
    assert_eq!(event.unique_id, domain);
    assert_eq!(event.entity(), EntityKind::Domain);
    assert_eq!(
        event.payload,
        EventPayload::DomainLifecycle {
            event: DomainEventType::Started,
            detail: 2,
        }
    );
    assert_eq!(event.describe(), "started (restored)");

    // Exactly one notification for one fired callback
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    conn.close().unwrap();
    assert_eq!(runner.state(), LoopState::Stopped);
}

/// Three consecutive events arrive in the order the native library fired them.
#[test]
fn test_fifo_delivery() {
    let (driver, _registrar, conn) = setup();
    let domain = Uuid::new_v4();
    let rx = collect(&conn, domain);
    let runner = EventLoopRunner::start(&conn, test_options()).unwrap();

    driver.emit_domain_event(domain.as_bytes(), DomainEventType::Started, 0);
    driver.emit_domain_event(domain.as_bytes(), DomainEventType::Suspended, 0);
    driver.emit_domain_event(domain.as_bytes(), DomainEventType::Started, 0);

    let received: Vec<DomainEventType> = (0..3)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("notification"))
        .map(|n| match n.payload {
            EventPayload::DomainLifecycle { event, .. } => event,
            other => panic!("unexpected payload {:?}", other),
        })
        .collect();

    assert_eq!(
        received,
        vec![
            DomainEventType::Started,
            DomainEventType::Suspended,
            DomainEventType::Started
        ]
    );
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    runner.dispose();
}

/// The nil identity never reaches a subscriber.
#[test]
fn test_nil_identity_is_dropped() {
    let (driver, _registrar, conn) = setup();
    let (tx, rx) = mpsc::channel();
    conn.subscribe_all(move |n| {
        let _ = tx.send(n.clone());
    });
    let runner = EventLoopRunner::start(&conn, test_options()).unwrap();

    driver.emit_domain_event(Uuid::nil().as_bytes(), DomainEventType::Crashed, 0);
    driver.emit_storage_pool_refresh(Uuid::nil());

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    runner.dispose();
}

/// Concurrent dispose calls deregister each callback exactly once.
#[test]
fn test_concurrent_dispose_is_idempotent() {
    let (driver, _registrar, conn) = setup();
    let runner = Arc::new(EventLoopRunner::start(&conn, test_options()).unwrap());

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let runner = Arc::clone(&runner);
            thread::spawn(move || runner.dispose())
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    runner.dispose();

    let stats = driver.stats();
    assert_eq!(stats.domain_deregistrations, 1);
    assert_eq!(stats.storage_pool_deregistrations, 2);
    assert!(runner.is_disposed());
    assert_eq!(driver.registered_callbacks(), 0);

    // Closing afterwards does not deregister again
    conn.close().unwrap();
    let stats = driver.stats();
    assert_eq!(stats.domain_deregistrations, 1);
    assert_eq!(stats.storage_pool_deregistrations, 2);
}

/// An iteration that never returns does not hold up shutdown past the bound.
#[test]
fn test_shutdown_join_is_bounded() {
    let (driver, _registrar, conn) = setup();
    let options = RunnerOptions {
        join_timeout: Duration::from_millis(200),
        ..test_options()
    };
    let runner = EventLoopRunner::start(&conn, options).unwrap();

    driver.set_hung(true);
    // Let the loop enter the hung iteration
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    conn.close().unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(5));

    // Deregistration still happened
    assert_eq!(runner.state(), LoopState::Stopped);
    assert_eq!(driver.registered_callbacks(), 0);

    driver.set_hung(false);
}

/// Storage pool lifecycle and refresh events reach pool subscribers only.
#[test]
fn test_storage_pool_events() {
    let (driver, _registrar, conn) = setup();
    let pool = Uuid::new_v4();
    let (tx, rx) = mpsc::channel();
    conn.subscribe_storage_pool(pool, move |n| {
        let _ = tx.send(n.clone());
    });
    let domain_rx = collect(&conn, pool);
    let runner = EventLoopRunner::start(&conn, test_options()).unwrap();

    driver.emit_storage_pool_event(pool, StoragePoolEventType::Started);
    driver.emit_storage_pool_refresh(pool);

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        first.payload,
        EventPayload::StoragePoolLifecycle {
            event: StoragePoolEventType::Started,
            detail: 0,
        }
    );
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second.payload, EventPayload::StoragePoolRefresh);

    // Same UUID subscribed as a domain sees nothing
    assert!(domain_rx.recv_timeout(Duration::from_millis(50)).is_err());

    runner.dispose();
}

/// Async consumers receive notifications through a channel subscription.
#[tokio::test]
async fn test_channel_subscription() {
    let (driver, _registrar, conn) = setup();
    let domain = Uuid::new_v4();
    let (sub, mut rx) = conn.subscribe_channel(EntityKind::Domain, Some(domain));
    let runner = EventLoopRunner::start(&conn, test_options()).unwrap();

    driver.emit_domain_event(domain.as_bytes(), DomainEventType::Defined, 1);

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(event.describe(), "defined (updated)");

    assert!(conn.unsubscribe(sub));
    conn.close().unwrap();
    runner.dispose();
}

/// Notifications serialize for log shipping.
#[test]
fn test_notification_json() {
    let id = Uuid::parse_str(KNOWN_DOMAIN).unwrap();
    let event = EventNotification::new(
        id,
        EventPayload::DomainLifecycle {
            event: DomainEventType::Stopped,
            detail: 1,
        },
    );

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["unique_id"], KNOWN_DOMAIN);
    assert_eq!(json["payload"]["kind"], "domain_lifecycle");
    assert_eq!(json["payload"]["event"], "stopped");
    assert_eq!(json["payload"]["detail"], 1);
}

/// Disposing without closing the connection stops the loop thread, so a
/// second runner on the same connection never iterates concurrently.
#[test]
fn test_dispose_stops_loop_thread() {
    let (driver, _registrar, conn) = setup();

    for _ in 0..2 {
        let runner = EventLoopRunner::start(&conn, test_options()).unwrap();
        thread::sleep(Duration::from_millis(30));
        runner.dispose();
        assert_eq!(runner.state(), LoopState::Stopped);

        let before = driver.stats().iterations;
        thread::sleep(Duration::from_millis(100));
        assert_eq!(driver.stats().iterations, before);
    }

    // Dropping behaves like dispose
    let runner = EventLoopRunner::start(&conn, test_options()).unwrap();
    drop(runner);
    let before = driver.stats().iterations;
    thread::sleep(Duration::from_millis(100));
    assert_eq!(driver.stats().iterations, before);
    assert!(!conn.is_closed());
}

/// A dispose racing the connection's shutdown waits for the join in
/// progress instead of deregistering underneath it.
#[test]
fn test_dispose_waits_for_join_in_progress() {
    let (driver, _registrar, conn) = setup();
    let options = RunnerOptions {
        join_timeout: Duration::from_millis(300),
        ..test_options()
    };
    let runner = EventLoopRunner::start(&conn, options).unwrap();

    driver.set_hung(true);
    thread::sleep(Duration::from_millis(50));

    let closing = Arc::clone(&conn);
    let closer = thread::spawn(move || closing.close());
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    runner.dispose();
    assert!(start.elapsed() >= Duration::from_millis(150));

    closer.join().unwrap().unwrap();
    let stats = driver.stats();
    assert_eq!(stats.domain_deregistrations, 1);
    assert_eq!(stats.storage_pool_deregistrations, 2);

    driver.set_hung(false);
}

/// Failing deregistrations are logged and not retried; dispose still completes.
#[test]
fn test_failed_deregistration_is_best_effort() {
    let (driver, _registrar, conn) = setup();
    let runner = EventLoopRunner::start(&conn, test_options()).unwrap();

    driver.reject_deregistration(true);
    runner.dispose();

    assert!(runner.is_disposed());
    assert_eq!(runner.state(), LoopState::Stopped);
    let stats = driver.stats();
    assert_eq!(stats.domain_deregistrations, 1);
    assert_eq!(stats.storage_pool_deregistrations, 2);
    // Rejected callbacks stay with the native side
    assert_eq!(driver.registered_callbacks(), 3);

    runner.dispose();
    conn.close().unwrap();
    let stats = driver.stats();
    assert_eq!(stats.domain_deregistrations, 1);
    assert_eq!(stats.storage_pool_deregistrations, 2);
}
