//! Event loop runner.
//!
//! The runner registers the connection-level event callbacks and keeps the
//! native event loop serviced on a dedicated thread:
//!
//! ```text
//!   Created ──start──▶ Running ──shutdown or dispose──▶ ShuttingDown ──release──▶ Stopped
//!                         │
//!                         └── negative iteration result ──▶ Failed
//! ```
//!
//! Native callbacks fire inside `run_iteration`. They only decode the payload
//! and queue a notification; subscribers run after the iteration returns, on
//! the same thread, in the order the native library produced the events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::connection::{Connection, ShutdownSignal};
use crate::error::{EventLoopError, Result};
use crate::traits::{EntityEventCallback, StoragePoolEventId, VirtDriver};
use crate::types::{
    resolve_identity, DomainEventType, EventNotification, EventPayload, NativeHandle,
    RawEntityEvent, RegistrationKind, StoragePoolEventType,
};

/// Default bound on waiting for the loop thread at shutdown.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default back-off while the connection is not alive.
pub const DEFAULT_LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Tunables for an [`EventLoopRunner`].
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// How long shutdown waits for the loop thread before giving up
    pub join_timeout: Duration,
    /// How long the loop waits before re-checking a dead connection
    pub liveness_poll: Duration,
    /// Name of the loop thread
    pub thread_name: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            liveness_poll: DEFAULT_LIVENESS_POLL,
            thread_name: "virtloop-events".to_string(),
        }
    }
}

impl RunnerOptions {
    /// Reject options the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.liveness_poll.is_zero() {
            return Err(EventLoopError::InvalidConfig(
                "liveness poll interval must be greater than zero".to_string(),
            ));
        }
        if self.thread_name.is_empty() || self.thread_name.contains('\0') {
            return Err(EventLoopError::InvalidConfig(format!(
                "invalid thread name {:?}",
                self.thread_name
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Created = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
    Failed = 4,
}

impl LoopState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LoopState::Created,
            1 => LoopState::Running,
            2 => LoopState::ShuttingDown,
            3 => LoopState::Stopped,
            _ => LoopState::Failed,
        }
    }
}

// =============================================================================
// REGISTRATIONS
// =============================================================================

/// Native registration ids of the runner's callbacks. Negative means unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registrations {
    pub domain_lifecycle: i32,
    pub storage_pool_lifecycle: i32,
    pub storage_pool_refresh: i32,
}

impl Default for Registrations {
    fn default() -> Self {
        Self {
            domain_lifecycle: -1,
            storage_pool_lifecycle: -1,
            storage_pool_refresh: -1,
        }
    }
}

impl Registrations {
    pub fn get(&self, kind: RegistrationKind) -> i32 {
        match kind {
            RegistrationKind::DomainLifecycle => self.domain_lifecycle,
            RegistrationKind::StoragePoolLifecycle => self.storage_pool_lifecycle,
            RegistrationKind::StoragePoolRefresh => self.storage_pool_refresh,
        }
    }

    fn set(&mut self, kind: RegistrationKind, id: i32) {
        match kind {
            RegistrationKind::DomainLifecycle => self.domain_lifecycle = id,
            RegistrationKind::StoragePoolLifecycle => self.storage_pool_lifecycle = id,
            RegistrationKind::StoragePoolRefresh => self.storage_pool_refresh = id,
        }
    }

    /// Deregister every non-negative registration.
    ///
    /// Failures are logged and skipped. Returns the number of deregistration
    /// calls issued.
    pub fn release(&self, driver: &dyn VirtDriver, conn: NativeHandle) -> usize {
        let kinds = [
            RegistrationKind::DomainLifecycle,
            RegistrationKind::StoragePoolLifecycle,
            RegistrationKind::StoragePoolRefresh,
        ];

        let mut issued = 0;
        for kind in kinds {
            let id = self.get(kind);
            if id < 0 {
                continue;
            }
            let rc = match kind {
                RegistrationKind::DomainLifecycle => driver.domain_event_deregister(conn, id),
                _ => driver.storage_pool_event_deregister(conn, id),
            };
            issued += 1;
            if rc < 0 {
                warn!(
                    kind = %kind,
                    registration_id = id,
                    error = %driver.last_error(),
                    "Failed to deregister event callback"
                );
            } else {
                debug!(kind = %kind, registration_id = id, "Event callback deregistered");
            }
        }
        issued
    }
}

// =============================================================================
// PENDING QUEUE
// =============================================================================

/// Notifications decoded inside an iteration, waiting for dispatch.
#[derive(Default)]
struct PendingEvents {
    queue: Mutex<VecDeque<EventNotification>>,
}

impl PendingEvents {
    fn push(&self, notification: EventNotification) {
        self.queue.lock().push_back(notification);
    }

    fn take(&self) -> VecDeque<EventNotification> {
        std::mem::take(&mut *self.queue.lock())
    }
}

/// Build the native callback for one registration kind.
fn decoder(kind: RegistrationKind, pending: Arc<PendingEvents>) -> EntityEventCallback {
    Arc::new(move |raw: RawEntityEvent| {
        debug!(kind = %kind, event = raw.event, detail = raw.detail, "Received native event");

        let Some(unique_id) = resolve_identity(&raw.identity) else {
            warn!(kind = %kind, "Received event for unknown {}", kind.entity());
            return;
        };

        let payload = match kind {
            RegistrationKind::DomainLifecycle => EventPayload::DomainLifecycle {
                event: DomainEventType::from_raw(raw.event),
                detail: raw.detail,
            },
            RegistrationKind::StoragePoolLifecycle => EventPayload::StoragePoolLifecycle {
                event: StoragePoolEventType::from_raw(raw.event),
                detail: raw.detail,
            },
            RegistrationKind::StoragePoolRefresh => EventPayload::StoragePoolRefresh,
        };
        pending.push(EventNotification::new(unique_id, payload));
    })
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Worker {
    thread: JoinHandle<()>,
    exited: mpsc::Receiver<()>,
}

/// State shared by the runner, its loop thread and its shutdown hook.
struct RunnerShared {
    driver: Arc<dyn VirtDriver>,
    handle: NativeHandle,
    registrations: Registrations,
    state: AtomicU8,
    disposed: AtomicBool,
    /// Stops this runner's loop thread; triggered by dispose or connection shutdown
    stop: ShutdownSignal,
    worker: Mutex<Option<Worker>>,
    /// Set once the loop thread was joined or the join gave up
    exit_settled: Mutex<bool>,
    exit_cond: Condvar,
    last_error: Mutex<Option<String>>,
    join_timeout: Duration,
}

impl RunnerShared {
    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn record_failure(&self, message: String) {
        *self.last_error.lock() = Some(message);
        self.transition(LoopState::Running, LoopState::Failed);
    }

    /// Stop the loop thread and wait, bounded, for it to exit.
    ///
    /// The first caller joins. Concurrent callers wait for that join to
    /// settle instead of returning early.
    fn await_exit(&self) {
        self.transition(LoopState::Running, LoopState::ShuttingDown);
        self.stop.trigger();

        let worker = {
            let mut slot = self.worker.lock();
            match slot.as_ref() {
                Some(worker) if worker.thread.thread().id() == thread::current().id() => {
                    // Shutdown requested by a subscriber on the loop thread itself
                    debug!("Shutdown requested from the event loop thread");
                    return;
                }
                _ => slot.take(),
            }
        };

        let Some(worker) = worker else {
            let mut settled = self.exit_settled.lock();
            if !*settled {
                self.exit_cond
                    .wait_while_for(&mut settled, |s| !*s, self.join_timeout);
            }
            return;
        };

        self.join_worker(worker);

        *self.exit_settled.lock() = true;
        self.exit_cond.notify_all();
    }

    fn join_worker(&self, worker: Worker) {
        match worker.exited.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    warn!("Event loop thread panicked");
                }
                debug!("Event loop thread joined");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "Event loop did not terminate in time"
                );
            }
        }
    }

    /// Deregister all callbacks, exactly once.
    fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let released = self.registrations.release(self.driver.as_ref(), self.handle);
        self.state.store(LoopState::Stopped as u8, Ordering::SeqCst);

        info!(released, "Event loop disposed");
    }
}

// =============================================================================
// LOOP THREAD
// =============================================================================

/// Signals the runner when the loop thread ends, even by panic.
struct ExitGuard(mpsc::Sender<()>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

struct LoopContext {
    shared: Arc<RunnerShared>,
    connection: Weak<Connection>,
    pending: Arc<PendingEvents>,
    liveness_poll: Duration,
}

impl LoopContext {
    fn run(self, _exit: ExitGuard) {
        info!("Event loop thread is running");

        let driver = Arc::clone(&self.shared.driver);
        let handle = self.shared.handle;

        let stop = &self.shared.stop;
        while !stop.is_triggered() {
            if !driver.is_alive(handle) {
                stop.wait_timeout(self.liveness_poll);
                continue;
            }

            let rc = driver.run_iteration();
            self.deliver_pending();

            if rc < 0 {
                let message = driver.last_error();
                error!(error = %message, "Event loop iteration failed, stopping event service");
                self.shared
                    .record_failure(EventLoopError::IterationFailed(message).to_string());
                return;
            }
        }

        self.deliver_pending();
        info!("Event loop thread ended");
    }

    fn deliver_pending(&self) {
        let batch = self.pending.take();
        if batch.is_empty() {
            return;
        }
        let Some(connection) = self.connection.upgrade() else {
            debug!(dropped = batch.len(), "Connection gone, dropping events");
            return;
        };
        for notification in &batch {
            connection.dispatch_event(notification);
        }
    }
}

// =============================================================================
// RUNNER
// =============================================================================

/// Bridges a connection's native event callbacks to its subscribers.
///
/// The process-wide event implementation must be installed (see
/// [`crate::EventRegistrar::install`]) before a runner is started.
pub struct EventLoopRunner {
    shared: Arc<RunnerShared>,
}

impl EventLoopRunner {
    /// Register the event callbacks on `connection` and start the loop thread.
    ///
    /// Fails on the first negative registration id. The registrations that
    /// succeeded before it are returned inside the error and stay installed.
    #[instrument(skip(connection, options), fields(uri = %connection.uri()))]
    pub fn start(connection: &Arc<Connection>, options: RunnerOptions) -> Result<Self> {
        options.validate()?;
        if connection.shutdown_signal().is_triggered() {
            return Err(EventLoopError::ConnectionClosed);
        }

        let driver = Arc::clone(connection.driver());
        let handle = connection.handle();
        let pending = Arc::new(PendingEvents::default());

        let mut registrations = Registrations::default();
        let kinds = [
            RegistrationKind::DomainLifecycle,
            RegistrationKind::StoragePoolLifecycle,
            RegistrationKind::StoragePoolRefresh,
        ];
        for kind in kinds {
            let callback = decoder(kind, Arc::clone(&pending));
            let id = match kind {
                RegistrationKind::DomainLifecycle => driver.domain_event_register(handle, callback),
                RegistrationKind::StoragePoolLifecycle => driver.storage_pool_event_register(
                    handle,
                    StoragePoolEventId::Lifecycle,
                    callback,
                ),
                RegistrationKind::StoragePoolRefresh => driver.storage_pool_event_register(
                    handle,
                    StoragePoolEventId::Refresh,
                    callback,
                ),
            };
            if id < 0 {
                let message = driver.last_error();
                error!(kind = %kind, error = %message, "Event callback registration failed");
                return Err(EventLoopError::RegistrationFailed {
                    kind,
                    message,
                    partial: registrations,
                });
            }
            debug!(kind = %kind, registration_id = id, "Event callback registered");
            registrations.set(kind, id);
        }

        let shared = Arc::new(RunnerShared {
            driver: Arc::clone(&driver),
            handle,
            registrations,
            state: AtomicU8::new(LoopState::Created as u8),
            disposed: AtomicBool::new(false),
            stop: ShutdownSignal::new(),
            worker: Mutex::new(None),
            exit_settled: Mutex::new(false),
            exit_cond: Condvar::new(),
            last_error: Mutex::new(None),
            join_timeout: options.join_timeout,
        });

        let (exit_tx, exit_rx) = mpsc::channel();
        let context = LoopContext {
            shared: Arc::clone(&shared),
            connection: Arc::downgrade(connection),
            pending,
            liveness_poll: options.liveness_poll,
        };

        shared.state.store(LoopState::Running as u8, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(options.thread_name.clone())
            .spawn(move || context.run(ExitGuard(exit_tx)));

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                error!(error = %e, "Failed to spawn event loop thread");
                shared.dispose();
                return Err(EventLoopError::SpawnFailed(e));
            }
        };
        *shared.worker.lock() = Some(Worker {
            thread,
            exited: exit_rx,
        });

        let hook = Arc::downgrade(&shared);
        connection.shutdown_signal().on_trigger(move || {
            if let Some(shared) = hook.upgrade() {
                shared.await_exit();
                shared.dispose();
            }
        });

        info!(
            thread = %options.thread_name,
            domain_lifecycle = registrations.domain_lifecycle,
            storage_pool_lifecycle = registrations.storage_pool_lifecycle,
            storage_pool_refresh = registrations.storage_pool_refresh,
            "Event loop started"
        );

        Ok(Self { shared })
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn registrations(&self) -> Registrations {
        self.shared.registrations
    }

    /// Error that terminated the loop thread, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Stop the loop thread and release the runner's callbacks.
    ///
    /// Safe to call any number of times from any thread; only the first
    /// call deregisters. Waits (bounded) for the loop thread first, so no
    /// iteration runs once this returns unless the join timed out. Never
    /// fails.
    pub fn dispose(&self) {
        self.shared.await_exit();
        self.shared.dispose();
    }
}

impl Drop for EventLoopRunner {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use std::time::Instant;
    use uuid::Uuid;

    fn fast_options() -> RunnerOptions {
        RunnerOptions {
            join_timeout: Duration::from_secs(5),
            liveness_poll: Duration::from_millis(10),
            thread_name: "virtloop-test".to_string(),
        }
    }

    fn open(driver: &Arc<MockDriver>) -> Arc<Connection> {
        let driver: Arc<dyn VirtDriver> = driver.clone();
        Connection::open(driver, "mock:///default").unwrap()
    }

    #[test]
    fn test_start_registers_three_callbacks() {
        let driver = Arc::new(MockDriver::new());
        let conn = open(&driver);

        let runner = EventLoopRunner::start(&conn, fast_options()).unwrap();
        assert_eq!(runner.state(), LoopState::Running);

        let regs = runner.registrations();
        assert!(regs.domain_lifecycle >= 0);
        assert!(regs.storage_pool_lifecycle >= 0);
        assert!(regs.storage_pool_refresh >= 0);
        assert_eq!(driver.registered_callbacks(), 3);

        conn.close().unwrap();
        assert_eq!(runner.state(), LoopState::Stopped);
        assert_eq!(driver.registered_callbacks(), 0);
    }

    #[test]
    fn test_registration_failure_aborts_start() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_registration(RegistrationKind::StoragePoolRefresh);
        let conn = open(&driver);

        let err = EventLoopRunner::start(&conn, fast_options()).err().unwrap();
        let partial = match err {
            EventLoopError::RegistrationFailed { kind, partial, .. } => {
                assert_eq!(kind, RegistrationKind::StoragePoolRefresh);
                partial
            }
            other => panic!("unexpected error: {}", other),
        };

        // Earlier registrations stay installed until released
        assert_eq!(driver.registered_callbacks(), 2);
        assert!(partial.storage_pool_refresh < 0);

        let issued = partial.release(conn.driver().as_ref(), conn.handle());
        assert_eq!(issued, 2);
        assert_eq!(driver.registered_callbacks(), 0);
    }

    #[test]
    fn test_release_skips_negative_ids() {
        let driver = Arc::new(MockDriver::new());
        let conn = open(&driver);

        let regs = Registrations {
            domain_lifecycle: -1,
            storage_pool_lifecycle: -1,
            storage_pool_refresh: -1,
        };
        assert_eq!(regs.release(driver.as_ref(), conn.handle()), 0);

        let stats = driver.stats();
        assert_eq!(stats.domain_deregistrations, 0);
        assert_eq!(stats.storage_pool_deregistrations, 0);
    }

    #[test]
    fn test_start_on_closed_connection() {
        let driver = Arc::new(MockDriver::new());
        let conn = open(&driver);
        conn.close().unwrap();

        assert!(matches!(
            EventLoopRunner::start(&conn, fast_options()),
            Err(EventLoopError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_iteration_failure_stops_loop_only() {
        let driver = Arc::new(MockDriver::new());
        let conn = open(&driver);
        let runner = EventLoopRunner::start(&conn, fast_options()).unwrap();

        driver.fail_next_iteration("connection reset");

        let deadline = Instant::now() + Duration::from_secs(5);
        while runner.state() != LoopState::Failed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(runner.state(), LoopState::Failed);
        assert!(runner.last_error().unwrap().contains("connection reset"));

        // The connection survives, unserviced
        let iterations = driver.stats().iterations;
        thread::sleep(Duration::from_millis(50));
        assert_eq!(driver.stats().iterations, iterations);
        assert!(conn.is_alive());

        runner.dispose();
        assert_eq!(driver.registered_callbacks(), 0);
    }

    #[test]
    fn test_dead_connection_is_not_iterated() {
        let driver = Arc::new(MockDriver::new());
        driver.set_alive(false);
        let conn = open(&driver);
        let runner = EventLoopRunner::start(&conn, fast_options()).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(driver.stats().iterations, 0);

        driver.set_alive(true);
        let deadline = Instant::now() + Duration::from_secs(5);
        while driver.stats().iterations == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(driver.stats().iterations > 0);

        drop(runner);
    }

    #[test]
    fn test_shutdown_wakes_liveness_wait() {
        let driver = Arc::new(MockDriver::new());
        driver.set_alive(false);
        let conn = open(&driver);
        let options = RunnerOptions {
            liveness_poll: Duration::from_secs(30),
            ..fast_options()
        };
        let runner = EventLoopRunner::start(&conn, options).unwrap();
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        conn.close().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(runner.state(), LoopState::Stopped);
    }

    #[test]
    fn test_unknown_identity_is_dropped() {
        let driver = Arc::new(MockDriver::new());
        let conn = open(&driver);
        let (tx, rx) = std::sync::mpsc::channel();
        conn.subscribe_all(move |n| {
            let _ = tx.send(n.clone());
        });
        let runner = EventLoopRunner::start(&conn, fast_options()).unwrap();

        driver.emit_domain_event(&[0u8; 16], DomainEventType::Started, 0);
        driver.emit_domain_event(&[], DomainEventType::Stopped, 0);
        let known = Uuid::new_v4();
        driver.emit_domain_event(known.as_bytes(), DomainEventType::Defined, 0);

        // Only the resolvable identity arrives
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.unique_id, known);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        runner.dispose();
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let driver = Arc::new(MockDriver::new());
        let conn = open(&driver);
        let options = RunnerOptions {
            liveness_poll: Duration::ZERO,
            ..fast_options()
        };

        assert!(matches!(
            EventLoopRunner::start(&conn, options),
            Err(EventLoopError::InvalidConfig(_))
        ));
        assert_eq!(driver.registered_callbacks(), 0);
    }

    #[test]
    fn test_dispose_wakes_liveness_wait() {
        let driver = Arc::new(MockDriver::new());
        driver.set_alive(false);
        let conn = open(&driver);
        let options = RunnerOptions {
            liveness_poll: Duration::from_secs(30),
            ..fast_options()
        };
        let runner = EventLoopRunner::start(&conn, options).unwrap();
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        runner.dispose();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(runner.state(), LoopState::Stopped);
        assert!(!conn.is_closed());
    }
}
