//! Native event dispatch registrar.
//!
//! The native library does not care how scheduling is performed; it only
//! needs six primitives to describe what it wants polled and when. The
//! registrar stores those requests and lets the host fire them, either by
//! polling the descriptor itself ([`EventRegistrar::run_once`]) or by
//! dispatching readiness it learned about elsewhere.
//!
//! The registrar follows the minimal single-slot contract: it tracks at most
//! one handle watch and one timeout watch. A new `add` supersedes whatever
//! was tracked before. The native library can register more than one of
//! each per connection, so this model only serves a single connection with
//! a single transport descriptor.

use std::io;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::traits::{FreeCallback, HandleCallback, TimeoutCallback, VirtDriver};
use crate::types::{HandleEvents, Opaque};

/// Watch id handed out by `add_handle`.
pub const HANDLE_WATCH_ID: i32 = 0;

/// Timer id handed out by `add_timeout`.
pub const TIMEOUT_TIMER_ID: i32 = 0;

/// Interval value meaning "timer registered but disabled".
pub const TIMEOUT_DISABLED: i32 = -1;

struct HandleWatch {
    fd: i32,
    events: HandleEvents,
    callback: HandleCallback,
    free: Option<FreeCallback>,
    opaque: Opaque,
}

struct TimeoutWatch {
    interval_ms: i32,
    active: bool,
    armed_at: Instant,
    callback: TimeoutCallback,
    free: Option<FreeCallback>,
    opaque: Opaque,
}

impl TimeoutWatch {
    /// Time left until the timer is due, `None` if it cannot fire.
    fn remaining(&self, now: Instant) -> Option<Duration> {
        if !self.active || self.interval_ms < 0 {
            return None;
        }
        let due = self.armed_at + Duration::from_millis(self.interval_ms as u64);
        Some(due.saturating_duration_since(now))
    }
}

/// Observable state of the handle watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleWatchState {
    pub watch: i32,
    pub fd: i32,
    pub events: HandleEvents,
    pub opaque: Opaque,
}

/// Observable state of the timeout watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutWatchState {
    pub timer: i32,
    pub interval_ms: i32,
    pub active: bool,
    pub opaque: Opaque,
}

/// Host-side implementation of the six native event callback slots.
pub struct EventRegistrar {
    handle: Mutex<Option<HandleWatch>>,
    timeout: Mutex<Option<TimeoutWatch>>,
    installed: Mutex<bool>,
    /// Bumped on every slot change so an idle `run_once` wakes up early
    generation: Mutex<u64>,
    changed: Condvar,
}

static GLOBAL_REGISTRAR: OnceLock<Arc<EventRegistrar>> = OnceLock::new();

impl EventRegistrar {
    /// Create a registrar that is not installed anywhere yet.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(None),
            timeout: Mutex::new(None),
            installed: Mutex::new(false),
            generation: Mutex::new(0),
            changed: Condvar::new(),
        })
    }

    /// The process-wide registrar.
    ///
    /// The native library accepts a single set of event callbacks per
    /// process, so every connection in the process shares this instance.
    pub fn global() -> Arc<Self> {
        GLOBAL_REGISTRAR.get_or_init(EventRegistrar::new).clone()
    }

    /// Install the six callback slots with `driver`.
    ///
    /// Idempotent: only the first successful call reaches the driver.
    pub fn install(self: &Arc<Self>, driver: &dyn VirtDriver) -> Result<()> {
        let mut installed = self.installed.lock();
        if *installed {
            debug!(driver = driver.name(), "Event implementation already installed");
            return Ok(());
        }

        driver.install_event_impl(Arc::clone(self))?;
        *installed = true;

        info!(driver = driver.name(), "Event implementation installed");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        *self.installed.lock()
    }

    // =========================================================================
    // Handle slots
    // =========================================================================

    /// Start watching `fd` for `events`. Returns the watch id.
    pub fn add_handle(
        &self,
        fd: i32,
        events: HandleEvents,
        callback: HandleCallback,
        opaque: Opaque,
        free: Option<FreeCallback>,
    ) -> i32 {
        let previous = self.handle.lock().replace(HandleWatch {
            fd,
            events,
            callback,
            free,
            opaque,
        });
        if let Some(previous) = previous {
            debug!(fd = previous.fd, "Handle watch superseded");
        }
        debug!(fd, events = %events, "Handle watch added");
        self.bump();
        HANDLE_WATCH_ID
    }

    /// Replace the event mask of a watch. Unknown watches are ignored.
    pub fn update_handle(&self, watch: i32, events: HandleEvents) {
        {
            let mut slot = self.handle.lock();
            match slot.as_mut() {
                Some(handle) if watch == HANDLE_WATCH_ID => {
                    handle.events = events;
                    trace!(watch, events = %events, "Handle watch updated");
                }
                _ => {
                    debug!(watch, "Update for unknown handle watch ignored");
                    return;
                }
            }
        }
        self.bump();
    }

    /// Stop watching and release the user data. Returns 0, or -1 if unknown.
    pub fn remove_handle(&self, watch: i32) -> i32 {
        if watch != HANDLE_WATCH_ID {
            return -1;
        }
        let Some(removed) = self.handle.lock().take() else {
            debug!(watch, "Remove for unknown handle watch");
            return -1;
        };
        self.bump();

        debug!(watch, fd = removed.fd, "Handle watch removed");
        if let Some(free) = removed.free {
            free(removed.opaque);
        }
        0
    }

    /// Current handle watch, if any.
    pub fn handle_watch(&self) -> Option<HandleWatchState> {
        self.handle.lock().as_ref().map(|h| HandleWatchState {
            watch: HANDLE_WATCH_ID,
            fd: h.fd,
            events: h.events,
            opaque: h.opaque,
        })
    }

    // =========================================================================
    // Timeout slots
    // =========================================================================

    /// Register a timer firing every `interval_ms` (-1 disables it).
    pub fn add_timeout(
        &self,
        interval_ms: i32,
        callback: TimeoutCallback,
        opaque: Opaque,
        free: Option<FreeCallback>,
    ) -> i32 {
        let previous = self.timeout.lock().replace(TimeoutWatch {
            interval_ms,
            active: true,
            armed_at: Instant::now(),
            callback,
            free,
            opaque,
        });
        if previous.map_or(false, |p| p.active) {
            debug!("Timeout watch superseded");
        }
        debug!(interval_ms, "Timeout watch added");
        self.bump();
        TIMEOUT_TIMER_ID
    }

    /// Change the interval of the active timer. The active flag is untouched.
    pub fn update_timeout(&self, timer: i32, interval_ms: i32) {
        {
            let mut slot = self.timeout.lock();
            match slot.as_mut() {
                Some(t) if timer == TIMEOUT_TIMER_ID && t.active => {
                    t.interval_ms = interval_ms;
                    t.armed_at = Instant::now();
                    trace!(timer, interval_ms, "Timeout watch updated");
                }
                _ => {
                    debug!(timer, "Update for unknown timeout watch ignored");
                    return;
                }
            }
        }
        self.bump();
    }

    /// Deactivate the timer and release the user data. Returns 0, or -1.
    pub fn remove_timeout(&self, timer: i32) -> i32 {
        if timer != TIMEOUT_TIMER_ID {
            return -1;
        }
        let released = {
            let mut slot = self.timeout.lock();
            match slot.as_mut() {
                Some(t) if t.active => {
                    t.active = false;
                    Some((t.free.take(), t.opaque))
                }
                _ => None,
            }
        };
        let Some((free, opaque)) = released else {
            debug!(timer, "Remove for unknown timeout watch");
            return -1;
        };
        self.bump();

        debug!(timer, "Timeout watch removed");
        if let Some(free) = free {
            free(opaque);
        }
        0
    }

    /// Current timeout watch, if one was ever added.
    pub fn timeout_watch(&self) -> Option<TimeoutWatchState> {
        self.timeout.lock().as_ref().map(|t| TimeoutWatchState {
            timer: TIMEOUT_TIMER_ID,
            interval_ms: t.interval_ms,
            active: t.active,
            opaque: t.opaque,
        })
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Fire the handle callback for `ready` events.
    ///
    /// Error and hangup are always reported; other bits are filtered by the
    /// watched mask. Returns whether the callback ran.
    pub fn dispatch_handle(&self, watch: i32, ready: HandleEvents) -> bool {
        let target = {
            let slot = self.handle.lock();
            match slot.as_ref() {
                Some(h) if watch == HANDLE_WATCH_ID => {
                    let mask = h.events | HandleEvents::ERROR | HandleEvents::HANGUP;
                    Some((Arc::clone(&h.callback), h.fd, ready & mask, h.opaque))
                }
                _ => None,
            }
        };

        match target {
            Some((callback, fd, ready, opaque)) if !ready.is_empty() => {
                trace!(watch, fd, ready = %ready, "Dispatching handle callback");
                callback(watch, fd, ready, opaque);
                true
            }
            _ => false,
        }
    }

    /// Fire the timeout callback if the timer is active and enabled.
    pub fn dispatch_timeout(&self, timer: i32) -> bool {
        let target = {
            let mut slot = self.timeout.lock();
            match slot.as_mut() {
                Some(t) if timer == TIMEOUT_TIMER_ID && t.active && t.interval_ms >= 0 => {
                    t.armed_at = Instant::now();
                    Some((Arc::clone(&t.callback), t.opaque))
                }
                _ => None,
            }
        };

        match target {
            Some((callback, opaque)) => {
                trace!(timer, "Dispatching timeout callback");
                callback(timer, opaque);
                true
            }
            None => false,
        }
    }

    /// Run one host-driven iteration.
    ///
    /// Polls the watched descriptor for at most `max_wait`, or less if the
    /// timer falls due earlier, then fires whatever is ready. Returns the
    /// number of callbacks fired.
    pub fn run_once(&self, max_wait: Duration) -> io::Result<usize> {
        let handle = self
            .handle
            .lock()
            .as_ref()
            .map(|h| (h.fd, h.events));
        let wait = match self.timeout_remaining() {
            Some(remaining) => remaining.min(max_wait),
            None => max_wait,
        };

        let mut fired = 0;
        match handle {
            Some((fd, events)) if fd >= 0 => {
                let ready = poll_descriptor(fd, events, wait)?;
                if !ready.is_empty() && self.dispatch_handle(HANDLE_WATCH_ID, ready) {
                    fired += 1;
                }
            }
            _ => self.wait_for_change(wait),
        }

        if self.timeout_remaining() == Some(Duration::ZERO)
            && self.dispatch_timeout(TIMEOUT_TIMER_ID)
        {
            fired += 1;
        }

        Ok(fired)
    }

    fn timeout_remaining(&self) -> Option<Duration> {
        self.timeout
            .lock()
            .as_ref()
            .and_then(|t| t.remaining(Instant::now()))
    }

    fn bump(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    fn wait_for_change(&self, wait: Duration) {
        if wait.is_zero() {
            return;
        }
        let mut generation = self.generation.lock();
        let start = *generation;
        self.changed
            .wait_while_for(&mut generation, |g| *g == start, wait);
    }
}

/// Wait up to `wait` for `events` on `fd` and return what is ready.
fn poll_descriptor(fd: i32, events: HandleEvents, wait: Duration) -> io::Result<HandleEvents> {
    let mut interest: libc::c_short = 0;
    if events.contains(HandleEvents::READABLE) {
        interest |= libc::POLLIN;
    }
    if events.contains(HandleEvents::WRITABLE) {
        interest |= libc::POLLOUT;
    }

    let mut pfd = libc::pollfd {
        fd,
        events: interest,
        revents: 0,
    };
    let timeout_ms = wait.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: `pfd` is a valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(HandleEvents::NONE);
        }
        warn!(fd, error = %err, "poll failed");
        return Err(err);
    }

    let mut ready = HandleEvents::NONE;
    if pfd.revents & libc::POLLIN != 0 {
        ready |= HandleEvents::READABLE;
    }
    if pfd.revents & libc::POLLOUT != 0 {
        ready |= HandleEvents::WRITABLE;
    }
    if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        ready |= HandleEvents::ERROR;
    }
    if pfd.revents & libc::POLLHUP != 0 {
        ready |= HandleEvents::HANGUP;
    }
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_handle() -> HandleCallback {
        Arc::new(|_, _, _, _| {})
    }

    fn counting_free(counter: &Arc<AtomicUsize>) -> FreeCallback {
        let counter = Arc::clone(counter);
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_handle_single_slot_replacement() {
        let registrar = EventRegistrar::new();

        let id = registrar.add_handle(5, HandleEvents::READABLE, noop_handle(), Opaque::new(1), None);
        assert_eq!(id, HANDLE_WATCH_ID);
        registrar.add_handle(7, HandleEvents::WRITABLE, noop_handle(), Opaque::new(2), None);
        registrar.update_handle(id, HandleEvents::READABLE | HandleEvents::WRITABLE);

        let state = registrar.handle_watch().unwrap();
        assert_eq!(state.fd, 7);
        assert_eq!(state.events, HandleEvents::READABLE | HandleEvents::WRITABLE);
        assert_eq!(state.opaque, Opaque::new(2));

        assert_eq!(registrar.remove_handle(id), 0);
        assert!(registrar.handle_watch().is_none());

        // Update after remove is a no-op, a second remove reports failure
        registrar.update_handle(id, HandleEvents::HANGUP);
        assert!(registrar.handle_watch().is_none());
        assert_eq!(registrar.remove_handle(id), -1);
    }

    #[test]
    fn test_handle_sequences_track_last_call() {
        // Every prefix of this sequence must leave the state of its last call
        let registrar = EventRegistrar::new();
        let mut expected: Option<(i32, HandleEvents)> = None;

        let steps: Vec<(&str, i32, HandleEvents)> = vec![
            ("add", 3, HandleEvents::READABLE),
            ("update", 0, HandleEvents::WRITABLE),
            ("remove", 0, HandleEvents::NONE),
            ("update", 0, HandleEvents::READABLE),
            ("add", 9, HandleEvents::READABLE | HandleEvents::HANGUP),
            ("add", 11, HandleEvents::ERROR),
            ("update", 0, HandleEvents::READABLE),
        ];

        for (op, fd, events) in steps {
            match op {
                "add" => {
                    registrar.add_handle(fd, events, noop_handle(), Opaque::NULL, None);
                    expected = Some((fd, events));
                }
                "update" => {
                    registrar.update_handle(HANDLE_WATCH_ID, events);
                    if let Some((_, ref mut e)) = expected {
                        *e = events;
                    }
                }
                _ => {
                    registrar.remove_handle(HANDLE_WATCH_ID);
                    expected = None;
                }
            }
            let actual = registrar.handle_watch().map(|s| (s.fd, s.events));
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_remove_handle_invokes_free_callback() {
        let registrar = EventRegistrar::new();
        let freed = Arc::new(AtomicUsize::new(0));

        registrar.add_handle(
            5,
            HandleEvents::READABLE,
            noop_handle(),
            Opaque::new(0xfeed),
            Some(counting_free(&freed)),
        );
        assert_eq!(registrar.remove_handle(HANDLE_WATCH_ID), 0);
        assert_eq!(freed.load(Ordering::SeqCst), 1);

        // No free callback stored: nothing to call
        registrar.add_handle(5, HandleEvents::READABLE, noop_handle(), Opaque::NULL, None);
        assert_eq!(registrar.remove_handle(HANDLE_WATCH_ID), 0);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_free_callback_may_reenter() {
        let registrar = EventRegistrar::new();
        let inner = Arc::clone(&registrar);
        let free: FreeCallback = Arc::new(move |_| {
            // Native code commonly re-registers from inside a free callback
            inner.add_timeout(10, Arc::new(|_, _| {}), Opaque::NULL, None);
        });

        registrar.add_handle(5, HandleEvents::READABLE, noop_handle(), Opaque::NULL, Some(free));
        assert_eq!(registrar.remove_handle(HANDLE_WATCH_ID), 0);
        assert!(registrar.timeout_watch().unwrap().active);
    }

    #[test]
    fn test_timeout_lifecycle() {
        let registrar = EventRegistrar::new();
        let freed = Arc::new(AtomicUsize::new(0));

        let timer = registrar.add_timeout(
            250,
            Arc::new(|_, _| {}),
            Opaque::new(3),
            Some(counting_free(&freed)),
        );
        assert_eq!(timer, TIMEOUT_TIMER_ID);

        registrar.update_timeout(timer, TIMEOUT_DISABLED);
        let state = registrar.timeout_watch().unwrap();
        assert_eq!(state.interval_ms, TIMEOUT_DISABLED);
        assert!(state.active);

        assert_eq!(registrar.remove_timeout(timer), 0);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert!(!registrar.timeout_watch().unwrap().active);

        // Inactive timers ignore updates and reject a second remove
        registrar.update_timeout(timer, 100);
        assert_eq!(registrar.timeout_watch().unwrap().interval_ms, TIMEOUT_DISABLED);
        assert_eq!(registrar.remove_timeout(timer), -1);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_timeout_respects_disabled() {
        let registrar = EventRegistrar::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        registrar.add_timeout(
            TIMEOUT_DISABLED,
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Opaque::NULL,
            None,
        );
        assert!(!registrar.dispatch_timeout(TIMEOUT_TIMER_ID));

        registrar.update_timeout(TIMEOUT_TIMER_ID, 0);
        assert!(registrar.dispatch_timeout(TIMEOUT_TIMER_ID));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_handle_filters_mask() {
        let registrar = EventRegistrar::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        registrar.add_handle(
            5,
            HandleEvents::READABLE,
            Arc::new(move |watch: i32, fd: i32, ready: HandleEvents, _: Opaque| {
                sink.lock().push((watch, fd, ready))
            }),
            Opaque::NULL,
            None,
        );

        assert!(!registrar.dispatch_handle(HANDLE_WATCH_ID, HandleEvents::WRITABLE));
        assert!(registrar.dispatch_handle(HANDLE_WATCH_ID, HandleEvents::READABLE));
        assert!(registrar.dispatch_handle(HANDLE_WATCH_ID, HandleEvents::HANGUP));
        assert!(!registrar.dispatch_handle(42, HandleEvents::READABLE));

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![(0, 5, HandleEvents::READABLE), (0, 5, HandleEvents::HANGUP)]
        );
    }

    #[test]
    fn test_run_once_polls_descriptor() {
        let registrar = EventRegistrar::new();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        registrar.add_handle(
            reader.as_raw_fd(),
            HandleEvents::READABLE,
            Arc::new(move |_: i32, _: i32, ready: HandleEvents, _: Opaque| {
                assert!(ready.contains(HandleEvents::READABLE));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Opaque::NULL,
            None,
        );

        // Nothing written yet
        assert_eq!(registrar.run_once(Duration::from_millis(10)).unwrap(), 0);

        writer.write_all(b"x").unwrap();
        assert_eq!(registrar.run_once(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_once_fires_due_timeout() {
        let registrar = EventRegistrar::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        registrar.add_timeout(
            0,
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Opaque::NULL,
            None,
        );

        assert_eq!(registrar.run_once(Duration::from_millis(50)).unwrap(), 1);
        assert_eq!(registrar.run_once(Duration::from_millis(50)).unwrap(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&EventRegistrar::global(), &EventRegistrar::global()));
    }
}
