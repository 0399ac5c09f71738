//! Mock native driver for testing and development.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EventLoopError, Result};
use crate::registrar::{EventRegistrar, HANDLE_WATCH_ID, TIMEOUT_TIMER_ID};
use crate::traits::{EntityEventCallback, HandleCallback, StoragePoolEventId, VirtDriver};
use crate::types::{
    DomainEventType, HandleEvents, NativeHandle, Opaque, RawEntityEvent, RegistrationKind,
    StoragePoolEventType,
};

/// How long an idle iteration blocks before returning.
const IDLE_ITERATION: Duration = Duration::from_millis(10);

/// Work queued for the next iteration.
enum Action {
    Domain(RawEntityEvent),
    StoragePool(StoragePoolEventId, RawEntityEvent),
    HandleReady(HandleEvents),
    TimeoutDue,
}

/// Counters of calls the runner made into the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    pub iterations: u64,
    pub install_calls: u64,
    pub domain_deregistrations: u64,
    pub storage_pool_deregistrations: u64,
    pub closed_connections: u64,
}

struct MockInner {
    alive: AtomicBool,
    next_handle: AtomicUsize,
    next_registration: AtomicI32,
    domain_callbacks: Mutex<BTreeMap<i32, EntityEventCallback>>,
    pool_callbacks: Mutex<BTreeMap<i32, (StoragePoolEventId, EntityEventCallback)>>,
    failing_registrations: Mutex<HashSet<RegistrationKind>>,
    fail_iteration: Mutex<Option<String>>,
    reject_deregistration: AtomicBool,
    hung: Mutex<bool>,
    unhung: Condvar,
    pending: Mutex<VecDeque<Action>>,
    wake: Condvar,
    /// Events "arriving on the transport", emitted when the handle fires
    inbound: Mutex<VecDeque<RawEntityEvent>>,
    registrar: Mutex<Option<Arc<EventRegistrar>>>,
    stats: Mutex<MockStats>,
    last_error: Mutex<String>,
}

impl MockInner {
    fn queue(&self, action: Action) {
        self.pending.lock().push_back(action);
        self.wake.notify_all();
    }

    fn emit_domain(&self, raw: RawEntityEvent) {
        let callbacks: Vec<EntityEventCallback> =
            self.domain_callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(raw.clone());
        }
    }

    fn emit_storage_pool(&self, event_id: StoragePoolEventId, raw: RawEntityEvent) {
        let callbacks: Vec<EntityEventCallback> = self
            .pool_callbacks
            .lock()
            .values()
            .filter(|(id, _)| *id == event_id)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(raw.clone());
        }
    }

    fn registrar(&self) -> Option<Arc<EventRegistrar>> {
        self.registrar.lock().clone()
    }

    fn perform(&self, action: Action) {
        match action {
            Action::Domain(raw) => self.emit_domain(raw),
            Action::StoragePool(event_id, raw) => self.emit_storage_pool(event_id, raw),
            Action::HandleReady(events) => {
                if let Some(registrar) = self.registrar() {
                    registrar.dispatch_handle(HANDLE_WATCH_ID, events);
                }
            }
            Action::TimeoutDue => {
                if let Some(registrar) = self.registrar() {
                    registrar.dispatch_timeout(TIMEOUT_TIMER_ID);
                }
            }
        }
    }

    fn deregistration_rejected(&self) -> bool {
        if !self.reject_deregistration.load(Ordering::SeqCst) {
            return false;
        }
        *self.last_error.lock() = "mock: deregistration rejected".to_string();
        true
    }

    fn register(&self, kind: RegistrationKind) -> Option<i32> {
        if self.failing_registrations.lock().contains(&kind) {
            *self.last_error.lock() = format!("mock: {} registration rejected", kind);
            return None;
        }
        Some(self.next_registration.fetch_add(1, Ordering::SeqCst))
    }
}

/// In-memory stand-in for the native library.
///
/// Events queued with the `emit_*` methods are delivered to the registered
/// callbacks from inside the next `run_iteration`, the way the native
/// library invokes them. Failures and hangs can be injected.
pub struct MockDriver {
    inner: Arc<MockInner>,
}

impl MockDriver {
    /// Create a new mock driver.
    pub fn new() -> Self {
        info!("Creating mock event driver");
        Self {
            inner: Arc::new(MockInner {
                alive: AtomicBool::new(true),
                next_handle: AtomicUsize::new(1),
                next_registration: AtomicI32::new(0),
                domain_callbacks: Mutex::new(BTreeMap::new()),
                pool_callbacks: Mutex::new(BTreeMap::new()),
                failing_registrations: Mutex::new(HashSet::new()),
                fail_iteration: Mutex::new(None),
                reject_deregistration: AtomicBool::new(false),
                hung: Mutex::new(false),
                unhung: Condvar::new(),
                pending: Mutex::new(VecDeque::new()),
                wake: Condvar::new(),
                inbound: Mutex::new(VecDeque::new()),
                registrar: Mutex::new(None),
                stats: Mutex::new(MockStats::default()),
                last_error: Mutex::new(String::new()),
            }),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.inner.alive.store(alive, Ordering::SeqCst);
    }

    /// Make registrations of `kind` return a negative id.
    pub fn fail_registration(&self, kind: RegistrationKind) {
        self.inner.failing_registrations.lock().insert(kind);
    }

    /// Make the next iteration return a negative value with `message`.
    pub fn fail_next_iteration(&self, message: &str) {
        *self.inner.fail_iteration.lock() = Some(message.to_string());
        self.inner.wake.notify_all();
    }

    /// Make deregistrations fail and leave the callback registered.
    pub fn reject_deregistration(&self, reject: bool) {
        self.inner.reject_deregistration.store(reject, Ordering::SeqCst);
    }

    /// Block every iteration until `set_hung(false)`.
    pub fn set_hung(&self, hung: bool) {
        *self.inner.hung.lock() = hung;
        self.inner.unhung.notify_all();
    }

    pub fn stats(&self) -> MockStats {
        self.inner.stats.lock().clone()
    }

    /// Number of connection-level callbacks currently registered.
    pub fn registered_callbacks(&self) -> usize {
        self.inner.domain_callbacks.lock().len() + self.inner.pool_callbacks.lock().len()
    }

    /// Queue a domain lifecycle event with a raw identity buffer.
    pub fn emit_domain_event(&self, identity: &[u8], event: DomainEventType, detail: i32) {
        self.inner.queue(Action::Domain(RawEntityEvent::new(
            identity,
            event.as_raw(),
            detail,
        )));
    }

    /// Queue a storage pool lifecycle event.
    pub fn emit_storage_pool_event(&self, pool_id: Uuid, event: StoragePoolEventType) {
        self.inner.queue(Action::StoragePool(
            StoragePoolEventId::Lifecycle,
            RawEntityEvent::new(pool_id.as_bytes().as_slice(), event.as_raw(), 0),
        ));
    }

    /// Queue a storage pool refresh event.
    pub fn emit_storage_pool_refresh(&self, pool_id: Uuid) {
        self.inner.queue(Action::StoragePool(
            StoragePoolEventId::Refresh,
            RawEntityEvent::new(pool_id.as_bytes().as_slice(), 0, 0),
        ));
    }

    // =========================================================================
    // Native-side simulation of the registrar slots
    // =========================================================================

    /// Ask the installed registrar to watch `fd`, as the native library does
    /// for its transport socket.
    ///
    /// When the watch fires readable, every event queued with
    /// [`MockDriver::queue_inbound`] is emitted to the domain callbacks.
    /// Returns the watch id, or -1 when no registrar is installed.
    pub fn simulate_add_handle(&self, fd: i32, events: HandleEvents) -> i32 {
        let Some(registrar) = self.inner.registrar() else {
            return -1;
        };
        let inner = Arc::downgrade(&self.inner);
        let callback: HandleCallback =
            Arc::new(move |watch: i32, fd: i32, ready: HandleEvents, _: Opaque| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                debug!(watch, fd, ready = %ready, "Mock transport ready");
                if !ready.contains(HandleEvents::READABLE) {
                    return;
                }
                let arrived: Vec<RawEntityEvent> = inner.inbound.lock().drain(..).collect();
                for raw in arrived {
                    inner.emit_domain(raw);
                }
            });
        registrar.add_handle(fd, events, callback, Opaque::NULL, None)
    }

    /// Store a domain event that the transport delivers on the next read.
    pub fn queue_inbound(&self, raw: RawEntityEvent) {
        self.inner.inbound.lock().push_back(raw);
    }

    /// Make the next iteration report the watched handle as ready.
    pub fn simulate_handle_ready(&self, events: HandleEvents) {
        self.inner.queue(Action::HandleReady(events));
    }

    /// Make the next iteration fire the registered timeout.
    pub fn simulate_timeout_due(&self) {
        self.inner.queue(Action::TimeoutDue);
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtDriver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(&self, uri: &str) -> Result<NativeHandle> {
        if uri.is_empty() {
            return Err(EventLoopError::ConnectionFailed("empty URI".to_string()));
        }
        let handle = self.inner.next_handle.fetch_add(1, Ordering::SeqCst);
        debug!(uri = %uri, handle, "Mock connection opened");
        Ok(NativeHandle::new(handle))
    }

    fn close(&self, conn: NativeHandle) -> i32 {
        debug!(handle = conn.as_raw(), "Mock connection closed");
        self.inner.stats.lock().closed_connections += 1;
        0
    }

    fn is_alive(&self, _conn: NativeHandle) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    fn install_event_impl(&self, registrar: Arc<EventRegistrar>) -> Result<()> {
        *self.inner.registrar.lock() = Some(registrar);
        self.inner.stats.lock().install_calls += 1;
        Ok(())
    }

    fn run_iteration(&self) -> i32 {
        {
            let mut hung = self.inner.hung.lock();
            while *hung {
                self.inner.unhung.wait(&mut hung);
            }
        }

        if let Some(message) = self.inner.fail_iteration.lock().take() {
            *self.inner.last_error.lock() = message;
            return -1;
        }

        self.inner.stats.lock().iterations += 1;

        let actions: Vec<Action> = {
            let mut pending = self.inner.pending.lock();
            if pending.is_empty() {
                self.inner.wake.wait_for(&mut pending, IDLE_ITERATION);
            }
            pending.drain(..).collect()
        };
        for action in actions {
            self.inner.perform(action);
        }
        0
    }

    fn domain_event_register(&self, _conn: NativeHandle, callback: EntityEventCallback) -> i32 {
        match self.inner.register(RegistrationKind::DomainLifecycle) {
            Some(id) => {
                self.inner.domain_callbacks.lock().insert(id, callback);
                id
            }
            None => -1,
        }
    }

    fn domain_event_deregister(&self, _conn: NativeHandle, registration_id: i32) -> i32 {
        self.inner.stats.lock().domain_deregistrations += 1;
        if self.inner.deregistration_rejected() {
            return -1;
        }
        match self.inner.domain_callbacks.lock().remove(&registration_id) {
            Some(_) => 0,
            None => {
                *self.inner.last_error.lock() =
                    format!("mock: no domain callback {}", registration_id);
                -1
            }
        }
    }

    fn storage_pool_event_register(
        &self,
        _conn: NativeHandle,
        event_id: StoragePoolEventId,
        callback: EntityEventCallback,
    ) -> i32 {
        let kind = match event_id {
            StoragePoolEventId::Lifecycle => RegistrationKind::StoragePoolLifecycle,
            StoragePoolEventId::Refresh => RegistrationKind::StoragePoolRefresh,
        };
        match self.inner.register(kind) {
            Some(id) => {
                self.inner
                    .pool_callbacks
                    .lock()
                    .insert(id, (event_id, callback));
                id
            }
            None => -1,
        }
    }

    fn storage_pool_event_deregister(&self, _conn: NativeHandle, registration_id: i32) -> i32 {
        self.inner.stats.lock().storage_pool_deregistrations += 1;
        if self.inner.deregistration_rejected() {
            return -1;
        }
        match self.inner.pool_callbacks.lock().remove(&registration_id) {
            Some(_) => 0,
            None => {
                *self.inner.last_error.lock() =
                    format!("mock: no storage pool callback {}", registration_id);
                -1
            }
        }
    }

    fn last_error(&self) -> String {
        self.inner.last_error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_ids_start_at_zero() {
        let driver = MockDriver::new();
        let conn = driver.open("mock:///default").unwrap();

        let first = driver.domain_event_register(conn, Arc::new(|_| {}));
        let second =
            driver.storage_pool_event_register(conn, StoragePoolEventId::Refresh, Arc::new(|_| {}));
        assert_eq!(first, 0);
        assert_eq!(second, 1);

        assert_eq!(driver.domain_event_deregister(conn, first), 0);
        assert_eq!(driver.domain_event_deregister(conn, first), -1);
        assert!(driver.last_error().contains("no domain callback"));
    }

    #[test]
    fn test_events_fire_inside_iteration() {
        let driver = MockDriver::new();
        let conn = driver.open("mock:///default").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        driver.domain_event_register(
            conn,
            Arc::new(move |raw: RawEntityEvent| sink.lock().push(raw.event)),
        );

        driver.emit_domain_event(&[7u8; 16], DomainEventType::Suspended, 0);
        assert!(seen.lock().is_empty());

        assert_eq!(driver.run_iteration(), 0);
        assert_eq!(*seen.lock(), vec![DomainEventType::Suspended.as_raw()]);
        assert_eq!(driver.stats().iterations, 1);
    }

    #[test]
    fn test_injected_iteration_failure() {
        let driver = MockDriver::new();
        driver.fail_next_iteration("boom");

        assert_eq!(driver.run_iteration(), -1);
        assert_eq!(driver.last_error(), "boom");
        assert_eq!(driver.run_iteration(), 0);
    }

    #[test]
    fn test_simulated_handle_needs_registrar() {
        let driver = MockDriver::new();
        assert_eq!(driver.simulate_add_handle(5, HandleEvents::READABLE), -1);

        let registrar = EventRegistrar::new();
        registrar.install(&driver).unwrap();
        registrar.install(&driver).unwrap();
        assert_eq!(driver.stats().install_calls, 1);

        assert_eq!(driver.simulate_add_handle(5, HandleEvents::READABLE), 0);
        assert_eq!(registrar.handle_watch().unwrap().fd, 5);
    }
}
