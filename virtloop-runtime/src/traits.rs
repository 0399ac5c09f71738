//! Native library abstraction.
//!
//! [`VirtDriver`] is the seam between the event loop bridge and the native
//! virtualization library. Every method mirrors one native entry point and
//! keeps the native return convention (negative means failure) so the
//! runner can apply the exact failure semantics of each call site.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registrar::EventRegistrar;
use crate::types::{HandleEvents, NativeHandle, Opaque, RawEntityEvent};

/// Callback stored by a handle watch: `(watch, fd, ready events, opaque)`.
pub type HandleCallback = Arc<dyn Fn(i32, i32, HandleEvents, Opaque) + Send + Sync>;

/// Callback stored by a timeout watch: `(timer, opaque)`.
pub type TimeoutCallback = Arc<dyn Fn(i32, Opaque) + Send + Sync>;

/// Releases the opaque user data of a watch.
pub type FreeCallback = Arc<dyn Fn(Opaque) + Send + Sync>;

/// Connection-level event callback, invoked from inside an iteration.
pub type EntityEventCallback = Arc<dyn Fn(RawEntityEvent) + Send + Sync>;

/// Storage pool event ids (`virStoragePoolEventID`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoragePoolEventId {
    Lifecycle = 0,
    Refresh = 1,
}

/// Which event implementation the native library is driven with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventImplMode {
    /// The native library's own default loop, iterated by the runner
    #[default]
    Default,
    /// The host-side registrar slots, iterated by [`EventRegistrar::run_once`]
    Host,
}

/// Native virtualization library as seen by the event loop bridge.
///
/// Implementations must be callable from any thread. `run_iteration` is only
/// ever called from the runner's background thread.
pub trait VirtDriver: Send + Sync {
    /// Driver name for logging.
    fn name(&self) -> &str;

    /// Open a connection and return its native handle.
    fn open(&self, uri: &str) -> Result<NativeHandle>;

    /// Close a connection. Returns a negative value on failure.
    fn close(&self, conn: NativeHandle) -> i32;

    /// Whether the connection is alive.
    fn is_alive(&self, conn: NativeHandle) -> bool;

    /// Install the event implementation with the native library.
    ///
    /// In [`EventImplMode::Host`] the driver hands the six callback slots of
    /// `registrar` to the native library. Called at most once per process.
    fn install_event_impl(&self, registrar: Arc<EventRegistrar>) -> Result<()>;

    /// Run one iteration of the event loop.
    ///
    /// Blocks until at least one watched handle or timeout fires, invoking
    /// the registered callbacks before returning. Negative means failure.
    fn run_iteration(&self) -> i32;

    /// Register a domain lifecycle callback. Returns the registration id.
    fn domain_event_register(&self, conn: NativeHandle, callback: EntityEventCallback) -> i32;

    /// Deregister a domain event callback by registration id.
    fn domain_event_deregister(&self, conn: NativeHandle, registration_id: i32) -> i32;

    /// Register a storage pool callback. Returns the registration id.
    fn storage_pool_event_register(
        &self,
        conn: NativeHandle,
        event_id: StoragePoolEventId,
        callback: EntityEventCallback,
    ) -> i32;

    /// Deregister a storage pool callback by registration id.
    fn storage_pool_event_deregister(&self, conn: NativeHandle, registration_id: i32) -> i32;

    /// Message of the last native error on this thread.
    fn last_error(&self) -> String;
}
