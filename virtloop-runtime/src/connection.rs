//! Connection handle, shutdown signal and subscriber registries.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{EventLoopError, Result};
use crate::traits::VirtDriver;
use crate::types::{EntityKind, EventNotification, NativeHandle};

// =============================================================================
// SHUTDOWN SIGNAL
// =============================================================================

type ShutdownHook = Box<dyn FnOnce() + Send>;

struct SignalState {
    triggered: bool,
    hooks: Vec<ShutdownHook>,
}

struct SignalInner {
    state: Mutex<SignalState>,
    cond: Condvar,
}

/// One-shot cooperative shutdown signal.
///
/// Waiters are woken as soon as the signal triggers. Hooks registered with
/// [`ShutdownSignal::on_trigger`] run once, on the triggering thread.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState {
                    triggered: false,
                    hooks: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.state.lock().triggered
    }

    /// Trigger the signal. Returns `false` if it was already triggered.
    pub fn trigger(&self) -> bool {
        let hooks = {
            let mut state = self.inner.state.lock();
            if state.triggered {
                return false;
            }
            state.triggered = true;
            std::mem::take(&mut state.hooks)
        };
        self.inner.cond.notify_all();

        for hook in hooks {
            hook();
        }
        true
    }

    /// Run `hook` when the signal triggers, or now if it already has.
    pub fn on_trigger(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.inner.state.lock();
            if !state.triggered {
                state.hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Wait up to `timeout` for the signal. Returns whether it triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.lock();
        if !state.triggered {
            self.inner
                .cond
                .wait_while_for(&mut state, |s| !s.triggered, timeout);
        }
        state.triggered
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SUBSCRIBERS
// =============================================================================

/// Handler invoked for each delivered notification.
pub type EventHandler = Arc<dyn Fn(&EventNotification) + Send + Sync>;

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

/// Subscribers for one entity kind, keyed by entity UUID.
pub struct SubscriberRegistry {
    kind: EntityKind,
    by_entity: RwLock<HashMap<Uuid, Vec<(SubscriptionId, EventHandler)>>>,
    wildcard: RwLock<Vec<(SubscriptionId, EventHandler)>>,
}

impl SubscriberRegistry {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            by_entity: RwLock::new(HashMap::new()),
            wildcard: RwLock::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Subscribe to events of one entity, or of all entities when `None`.
    pub fn subscribe(&self, entity_id: Option<Uuid>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.insert(id, entity_id, handler);
        id
    }

    fn insert(&self, id: SubscriptionId, entity_id: Option<Uuid>, handler: EventHandler) {
        match entity_id {
            Some(entity_id) => self
                .by_entity
                .write()
                .entry(entity_id)
                .or_default()
                .push((id, handler)),
            None => self.wildcard.write().push((id, handler)),
        }
    }

    /// Remove a subscription. Returns whether it was found.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut found = false;
        {
            let mut by_entity = self.by_entity.write();
            by_entity.retain(|_, handlers| {
                let before = handlers.len();
                handlers.retain(|(sub, _)| *sub != id);
                found |= handlers.len() != before;
                !handlers.is_empty()
            });
        }
        let mut wildcard = self.wildcard.write();
        let before = wildcard.len();
        wildcard.retain(|(sub, _)| *sub != id);
        found || wildcard.len() != before
    }

    /// Number of handlers that would receive an event for `entity_id`.
    pub fn subscriber_count(&self, entity_id: Uuid) -> usize {
        let specific = self
            .by_entity
            .read()
            .get(&entity_id)
            .map_or(0, |handlers| handlers.len());
        specific + self.wildcard.read().len()
    }

    /// Deliver `notification` to the subscribers of `entity_id`.
    ///
    /// Handlers run on the calling thread with no registry lock held, so
    /// they may subscribe or unsubscribe. A panicking handler is logged and
    /// does not affect the others. Returns the number of handlers invoked.
    pub fn dispatch_event(&self, entity_id: Uuid, notification: &EventNotification) -> usize {
        let mut handlers: Vec<EventHandler> = self
            .by_entity
            .read()
            .get(&entity_id)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        handlers.extend(self.wildcard.read().iter().map(|(_, h)| Arc::clone(h)));

        if handlers.is_empty() {
            debug!(kind = %self.kind, entity_id = %entity_id, "No subscribers for event");
            return 0;
        }

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
                warn!(kind = %self.kind, entity_id = %entity_id, "Event subscriber panicked");
            }
        }
        handlers.len()
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// One session with a virtualization host.
///
/// Owned by the caller. Event loop runners only keep a weak reference, so
/// dropping the last `Arc<Connection>` closes the session and shuts down
/// any runner attached to it.
pub struct Connection {
    driver: Arc<dyn VirtDriver>,
    uri: String,
    handle: NativeHandle,
    shutdown: ShutdownSignal,
    domains: SubscriberRegistry,
    storage_pools: SubscriberRegistry,
    closed: AtomicBool,
}

impl Connection {
    /// Open a connection to `uri` through `driver`.
    #[instrument(skip(driver), fields(driver = driver.name()))]
    pub fn open(driver: Arc<dyn VirtDriver>, uri: &str) -> Result<Arc<Self>> {
        info!(uri = %uri, "Opening connection");

        let handle = driver.open(uri)?;

        info!(uri = %uri, "Connection opened");

        Ok(Arc::new(Self {
            driver,
            uri: uri.to_string(),
            handle,
            shutdown: ShutdownSignal::new(),
            domains: SubscriberRegistry::new(EntityKind::Domain),
            storage_pools: SubscriberRegistry::new(EntityKind::StoragePool),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn driver(&self) -> &Arc<dyn VirtDriver> {
        &self.driver
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Whether the native session is alive and not shut down.
    pub fn is_alive(&self) -> bool {
        !self.shutdown.is_triggered() && self.driver.is_alive(self.handle)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn registry(&self, kind: EntityKind) -> &SubscriberRegistry {
        match kind {
            EntityKind::Domain => &self.domains,
            EntityKind::StoragePool => &self.storage_pools,
        }
    }

    /// Subscribe to events of one domain.
    pub fn subscribe_domain<F>(&self, domain_id: Uuid, handler: F) -> SubscriptionId
    where
        F: Fn(&EventNotification) + Send + Sync + 'static,
    {
        self.domains.subscribe(Some(domain_id), Arc::new(handler))
    }

    /// Subscribe to events of one storage pool.
    pub fn subscribe_storage_pool<F>(&self, pool_id: Uuid, handler: F) -> SubscriptionId
    where
        F: Fn(&EventNotification) + Send + Sync + 'static,
    {
        self.storage_pools.subscribe(Some(pool_id), Arc::new(handler))
    }

    /// Subscribe to every event of every entity kind.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&EventNotification) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        let id = SubscriptionId::next();
        self.domains.insert(id, None, Arc::clone(&handler));
        self.storage_pools.insert(id, None, handler);
        id
    }

    /// Subscribe through a channel, for async consumers.
    ///
    /// Notifications for `entity_id` (or all entities of `kind` when `None`)
    /// are forwarded without blocking the event loop thread.
    pub fn subscribe_channel(
        &self,
        kind: EntityKind,
        entity_id: Option<Uuid>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<EventNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.registry(kind).subscribe(
            entity_id,
            Arc::new(move |notification: &EventNotification| {
                // A dropped receiver just stops listening
                let _ = tx.send(notification.clone());
            }),
        );
        (id, rx)
    }

    /// Remove a subscription created by any `subscribe*` method.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let domain = self.domains.unsubscribe(id);
        let pool = self.storage_pools.unsubscribe(id);
        domain || pool
    }

    /// Deliver a notification to the subscribers of its entity.
    pub fn dispatch_event(&self, notification: &EventNotification) -> usize {
        self.registry(notification.entity())
            .dispatch_event(notification.unique_id, notification)
    }

    /// Shut down event service and close the native session.
    ///
    /// Triggers the shutdown signal first, which lets attached runners stop
    /// and deregister while the native handle is still open.
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        info!(uri = %self.uri, "Closing connection");
        self.shutdown.trigger();

        if self.driver.close(self.handle) < 0 {
            let message = self.driver.last_error();
            warn!(uri = %self.uri, error = %message, "Failed to close connection");
            return Err(EventLoopError::ConnectionFailed(message));
        }

        info!(uri = %self.uri, "Connection closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Error closing connection on drop");
        }
    }
}
