//! Libvirt driver implementation.
//!
//! Connections are opened through the `virt` crate. The event entry points
//! are declared here directly because they take C callbacks: every callback
//! handed to libvirt is an `extern "C"` trampoline that forwards into Rust.

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uchar, c_void};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use virt::connect::Connect;

use crate::error::{EventLoopError, Result};
use crate::registrar::EventRegistrar;
use crate::traits::{
    EntityEventCallback, EventImplMode, FreeCallback, HandleCallback, StoragePoolEventId,
    TimeoutCallback, VirtDriver,
};
use crate::types::{HandleEvents, NativeHandle, Opaque, RawEntityEvent, RAW_IDENTITY_LEN};

/// Upper bound of one host-driven iteration.
const HOST_ITERATION_WAIT: Duration = Duration::from_secs(1);

const VIR_DOMAIN_EVENT_ID_LIFECYCLE: c_int = 0;

// =============================================================================
// FFI
// =============================================================================

type VirFreeCallback = Option<unsafe extern "C" fn(opaque: *mut c_void)>;
type VirEventHandleCallback =
    Option<unsafe extern "C" fn(watch: c_int, fd: c_int, events: c_int, opaque: *mut c_void)>;
type VirEventTimeoutCallback = Option<unsafe extern "C" fn(timer: c_int, opaque: *mut c_void)>;

type VirEventAddHandleFunc = Option<
    unsafe extern "C" fn(
        fd: c_int,
        event: c_int,
        cb: VirEventHandleCallback,
        opaque: *mut c_void,
        ff: VirFreeCallback,
    ) -> c_int,
>;
type VirEventUpdateHandleFunc = Option<unsafe extern "C" fn(watch: c_int, event: c_int)>;
type VirEventRemoveHandleFunc = Option<unsafe extern "C" fn(watch: c_int) -> c_int>;
type VirEventAddTimeoutFunc = Option<
    unsafe extern "C" fn(
        timeout: c_int,
        cb: VirEventTimeoutCallback,
        opaque: *mut c_void,
        ff: VirFreeCallback,
    ) -> c_int,
>;
type VirEventUpdateTimeoutFunc = Option<unsafe extern "C" fn(timer: c_int, timeout: c_int)>;
type VirEventRemoveTimeoutFunc = Option<unsafe extern "C" fn(timer: c_int) -> c_int>;

/// `virConnect*EventGenericCallback`: `(conn, entity, opaque)`.
type VirGenericEventCallback =
    Option<unsafe extern "C" fn(conn: *mut c_void, entity: *mut c_void, opaque: *mut c_void)>;

/// Lifecycle callbacks: `(conn, entity, event, detail, opaque)`.
type LifecycleFn = unsafe extern "C" fn(*mut c_void, *mut c_void, c_int, c_int, *mut c_void);
type GenericFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void);

#[link(name = "virt")]
extern "C" {
    fn virGetLastErrorMessage() -> *const c_char;

    fn virEventRegisterImpl(
        add_handle: VirEventAddHandleFunc,
        update_handle: VirEventUpdateHandleFunc,
        remove_handle: VirEventRemoveHandleFunc,
        add_timeout: VirEventAddTimeoutFunc,
        update_timeout: VirEventUpdateTimeoutFunc,
        remove_timeout: VirEventRemoveTimeoutFunc,
    );
    fn virEventRegisterDefaultImpl() -> c_int;
    fn virEventRunDefaultImpl() -> c_int;

    fn virConnectDomainEventRegisterAny(
        conn: *mut c_void,
        dom: *mut c_void,
        event_id: c_int,
        cb: VirGenericEventCallback,
        opaque: *mut c_void,
        freecb: VirFreeCallback,
    ) -> c_int;
    fn virConnectDomainEventDeregisterAny(conn: *mut c_void, callback_id: c_int) -> c_int;

    fn virConnectStoragePoolEventRegisterAny(
        conn: *mut c_void,
        pool: *mut c_void,
        event_id: c_int,
        cb: VirGenericEventCallback,
        opaque: *mut c_void,
        freecb: VirFreeCallback,
    ) -> c_int;
    fn virConnectStoragePoolEventDeregisterAny(conn: *mut c_void, callback_id: c_int) -> c_int;

    fn virDomainGetUUID(domain: *mut c_void, uuid: *mut c_uchar) -> c_int;
    fn virStoragePoolGetUUID(pool: *mut c_void, uuid: *mut c_uchar) -> c_int;
}

fn last_native_error() -> String {
    // SAFETY: libvirt returns a thread-local, NUL-terminated string.
    unsafe {
        let message = virGetLastErrorMessage();
        if message.is_null() {
            "unknown libvirt error".to_string()
        } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
        }
    }
}

// =============================================================================
// HOST EVENT SLOTS
// =============================================================================

/// Registrar behind the six slots. libvirt accepts one set per process.
static HOST_REGISTRAR: OnceLock<Arc<EventRegistrar>> = OnceLock::new();

unsafe extern "C" fn slot_add_handle(
    fd: c_int,
    events: c_int,
    cb: VirEventHandleCallback,
    opaque: *mut c_void,
    ff: VirFreeCallback,
) -> c_int {
    let (Some(registrar), Some(cb)) = (HOST_REGISTRAR.get(), cb) else {
        return -1;
    };
    let callback: HandleCallback =
        Arc::new(move |watch: i32, fd: i32, ready: HandleEvents, opaque: Opaque| {
            // SAFETY: libvirt guarantees `cb` stays valid until the watch is removed.
            unsafe { cb(watch, fd, ready.bits(), opaque.as_raw() as *mut c_void) }
        });
    registrar.add_handle(
        fd,
        HandleEvents::from_bits_truncate(events),
        callback,
        Opaque::new(opaque as usize),
        free_callback(ff),
    )
}

unsafe extern "C" fn slot_update_handle(watch: c_int, events: c_int) {
    if let Some(registrar) = HOST_REGISTRAR.get() {
        registrar.update_handle(watch, HandleEvents::from_bits_truncate(events));
    }
}

unsafe extern "C" fn slot_remove_handle(watch: c_int) -> c_int {
    HOST_REGISTRAR
        .get()
        .map_or(-1, |registrar| registrar.remove_handle(watch))
}

unsafe extern "C" fn slot_add_timeout(
    interval: c_int,
    cb: VirEventTimeoutCallback,
    opaque: *mut c_void,
    ff: VirFreeCallback,
) -> c_int {
    let (Some(registrar), Some(cb)) = (HOST_REGISTRAR.get(), cb) else {
        return -1;
    };
    let callback: TimeoutCallback = Arc::new(move |timer: i32, opaque: Opaque| {
        // SAFETY: libvirt guarantees `cb` stays valid until the timer is removed.
        unsafe { cb(timer, opaque.as_raw() as *mut c_void) }
    });
    registrar.add_timeout(interval, callback, Opaque::new(opaque as usize), free_callback(ff))
}

unsafe extern "C" fn slot_update_timeout(timer: c_int, interval: c_int) {
    if let Some(registrar) = HOST_REGISTRAR.get() {
        registrar.update_timeout(timer, interval);
    }
}

unsafe extern "C" fn slot_remove_timeout(timer: c_int) -> c_int {
    HOST_REGISTRAR
        .get()
        .map_or(-1, |registrar| registrar.remove_timeout(timer))
}

fn free_callback(ff: VirFreeCallback) -> Option<FreeCallback> {
    ff.map(|ff| {
        Arc::new(move |opaque: Opaque| {
            // SAFETY: `ff` releases the opaque pointer it was registered with.
            unsafe { ff(opaque.as_raw() as *mut c_void) }
        }) as FreeCallback
    })
}

// =============================================================================
// CONNECTION EVENT TRAMPOLINES
// =============================================================================

type UuidFn = unsafe extern "C" fn(*mut c_void, *mut c_uchar) -> c_int;

/// Read the 16-byte identity of a domain or pool; empty on failure.
unsafe fn read_identity(entity: *mut c_void, get_uuid: UuidFn) -> Vec<u8> {
    let mut buf = [0u8; RAW_IDENTITY_LEN];
    if entity.is_null() || get_uuid(entity, buf.as_mut_ptr()) < 0 {
        return Vec::new();
    }
    buf.to_vec()
}

unsafe fn forward(opaque: *mut c_void, raw: RawEntityEvent) {
    if opaque.is_null() {
        return;
    }
    let callback = &*(opaque as *const EntityEventCallback);
    callback(raw);
}

unsafe extern "C" fn domain_lifecycle_trampoline(
    _conn: *mut c_void,
    dom: *mut c_void,
    event: c_int,
    detail: c_int,
    opaque: *mut c_void,
) {
    let identity = read_identity(dom, virDomainGetUUID);
    forward(opaque, RawEntityEvent::new(identity, event, detail));
}

unsafe extern "C" fn storage_pool_lifecycle_trampoline(
    _conn: *mut c_void,
    pool: *mut c_void,
    event: c_int,
    detail: c_int,
    opaque: *mut c_void,
) {
    let identity = read_identity(pool, virStoragePoolGetUUID);
    forward(opaque, RawEntityEvent::new(identity, event, detail));
}

unsafe extern "C" fn storage_pool_refresh_trampoline(
    _conn: *mut c_void,
    pool: *mut c_void,
    opaque: *mut c_void,
) {
    let identity = read_identity(pool, virStoragePoolGetUUID);
    forward(opaque, RawEntityEvent::new(identity, 0, 0));
}

unsafe extern "C" fn free_entity_callback(opaque: *mut c_void) {
    if !opaque.is_null() {
        drop(Box::from_raw(opaque as *mut EntityEventCallback));
    }
}

fn generic(callback: LifecycleFn) -> VirGenericEventCallback {
    // SAFETY: libvirt calls lifecycle callbacks with the lifecycle signature;
    // the registration API only takes the generic pointer type.
    Some(unsafe { std::mem::transmute::<LifecycleFn, GenericFn>(callback) })
}

// =============================================================================
// DRIVER
// =============================================================================

struct Session(Connect);

// SAFETY: libvirt connection objects may be used from any thread.
unsafe impl Send for Session {}
unsafe impl Sync for Session {}

/// Libvirt-backed [`VirtDriver`].
///
/// In [`EventImplMode::Default`] libvirt's own event loop is registered and
/// iterated with `virEventRunDefaultImpl`. In [`EventImplMode::Host`] the
/// registrar's six slots are installed and iterated by polling the watched
/// descriptor. Either way the event implementation must be installed before
/// the first connection is opened.
pub struct LibvirtDriver {
    mode: EventImplMode,
    sessions: Mutex<HashMap<usize, Session>>,
    host_error: Mutex<Option<String>>,
}

impl LibvirtDriver {
    pub fn new(mode: EventImplMode) -> Self {
        info!(mode = ?mode, "Creating libvirt event driver");
        Self {
            mode,
            sessions: Mutex::new(HashMap::new()),
            host_error: Mutex::new(None),
        }
    }

    fn raw(conn: NativeHandle) -> *mut c_void {
        conn.as_raw() as *mut c_void
    }

    fn register_entity(
        &self,
        conn: NativeHandle,
        callback: EntityEventCallback,
        register: impl FnOnce(*mut c_void, *mut c_void, VirFreeCallback) -> c_int,
    ) -> i32 {
        let opaque = Box::into_raw(Box::new(callback)) as *mut c_void;
        let id = register(Self::raw(conn), opaque, Some(free_entity_callback));
        if id < 0 {
            // libvirt does not take ownership of `opaque` on failure
            // SAFETY: `opaque` came from `Box::into_raw` above.
            unsafe { free_entity_callback(opaque) };
        }
        id
    }
}

impl VirtDriver for LibvirtDriver {
    fn name(&self) -> &str {
        "libvirt"
    }

    fn open(&self, uri: &str) -> Result<NativeHandle> {
        let connection =
            Connect::open(Some(uri)).map_err(|e| EventLoopError::ConnectionFailed(e.to_string()))?;
        let handle = NativeHandle::new(connection.as_ptr() as usize);
        self.sessions
            .lock()
            .insert(handle.as_raw(), Session(connection));
        debug!(uri = %uri, "Connected to libvirt");
        Ok(handle)
    }

    fn close(&self, conn: NativeHandle) -> i32 {
        let Some(Session(mut connection)) = self.sessions.lock().remove(&conn.as_raw()) else {
            return -1;
        };
        match connection.close() {
            Ok(_) => 0,
            Err(e) => {
                warn!(error = %e, "Failed to close libvirt connection");
                -1
            }
        }
    }

    fn is_alive(&self, conn: NativeHandle) -> bool {
        self.sessions
            .lock()
            .get(&conn.as_raw())
            .map_or(false, |session| session.0.is_alive().unwrap_or(false))
    }

    fn install_event_impl(&self, registrar: Arc<EventRegistrar>) -> Result<()> {
        match self.mode {
            EventImplMode::Default => {
                // SAFETY: plain FFI call without arguments.
                if unsafe { virEventRegisterDefaultImpl() } < 0 {
                    return Err(EventLoopError::EventImplFailed(last_native_error()));
                }
            }
            EventImplMode::Host => {
                let installed = HOST_REGISTRAR.get_or_init(|| Arc::clone(&registrar));
                if !Arc::ptr_eq(installed, &registrar) {
                    return Err(EventLoopError::EventImplFailed(
                        "another registrar is already installed in this process".to_string(),
                    ));
                }
                // SAFETY: the slot functions live for the whole program.
                unsafe {
                    virEventRegisterImpl(
                        Some(slot_add_handle),
                        Some(slot_update_handle),
                        Some(slot_remove_handle),
                        Some(slot_add_timeout),
                        Some(slot_update_timeout),
                        Some(slot_remove_timeout),
                    );
                }
            }
        }
        Ok(())
    }

    fn run_iteration(&self) -> i32 {
        match self.mode {
            // SAFETY: plain FFI call without arguments.
            EventImplMode::Default => unsafe { virEventRunDefaultImpl() },
            EventImplMode::Host => {
                let Some(registrar) = HOST_REGISTRAR.get() else {
                    *self.host_error.lock() = Some("event implementation not installed".to_string());
                    return -1;
                };
                match registrar.run_once(HOST_ITERATION_WAIT) {
                    Ok(_) => 0,
                    Err(e) => {
                        *self.host_error.lock() = Some(e.to_string());
                        -1
                    }
                }
            }
        }
    }

    fn domain_event_register(&self, conn: NativeHandle, callback: EntityEventCallback) -> i32 {
        self.register_entity(conn, callback, |conn, opaque, freecb| unsafe {
            virConnectDomainEventRegisterAny(
                conn,
                std::ptr::null_mut(),
                VIR_DOMAIN_EVENT_ID_LIFECYCLE,
                generic(domain_lifecycle_trampoline),
                opaque,
                freecb,
            )
        })
    }

    fn domain_event_deregister(&self, conn: NativeHandle, registration_id: i32) -> i32 {
        // SAFETY: `conn` is a live connection pointer owned by `sessions`.
        unsafe { virConnectDomainEventDeregisterAny(Self::raw(conn), registration_id) }
    }

    fn storage_pool_event_register(
        &self,
        conn: NativeHandle,
        event_id: StoragePoolEventId,
        callback: EntityEventCallback,
    ) -> i32 {
        let trampoline = match event_id {
            StoragePoolEventId::Lifecycle => generic(storage_pool_lifecycle_trampoline),
            StoragePoolEventId::Refresh => Some(storage_pool_refresh_trampoline as GenericFn),
        };
        self.register_entity(conn, callback, |conn, opaque, freecb| unsafe {
            virConnectStoragePoolEventRegisterAny(
                conn,
                std::ptr::null_mut(),
                event_id as c_int,
                trampoline,
                opaque,
                freecb,
            )
        })
    }

    fn storage_pool_event_deregister(&self, conn: NativeHandle, registration_id: i32) -> i32 {
        // SAFETY: `conn` is a live connection pointer owned by `sessions`.
        unsafe { virConnectStoragePoolEventDeregisterAny(Self::raw(conn), registration_id) }
    }

    fn last_error(&self) -> String {
        match self.host_error.lock().take() {
            Some(message) => message,
            None => last_native_error(),
        }
    }
}
