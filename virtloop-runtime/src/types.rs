//! Type definitions for native tokens, event masks and notifications.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// NATIVE TOKENS
// =============================================================================

/// Opaque native connection handle.
///
/// Wraps the raw pointer value handed out by the native library. The value is
/// never dereferenced outside the driver that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(usize);

impl NativeHandle {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> usize {
        self.0
    }
}

/// Opaque user-data token passed through the six event callback slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Opaque(usize);

impl Opaque {
    pub const NULL: Opaque = Opaque(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> usize {
        self.0
    }
}

// =============================================================================
// HANDLE EVENT MASK
// =============================================================================

/// Readiness mask of a watched descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HandleEvents(u32);

impl HandleEvents {
    pub const NONE: HandleEvents = HandleEvents(0);
    pub const READABLE: HandleEvents = HandleEvents(1);
    pub const WRITABLE: HandleEvents = HandleEvents(2);
    pub const ERROR: HandleEvents = HandleEvents(4);
    pub const HANGUP: HandleEvents = HandleEvents(8);

    const ALL: u32 = 0b1111;

    /// Build a mask from the native integer, dropping unknown bits.
    pub const fn from_bits_truncate(bits: i32) -> Self {
        Self(bits as u32 & Self::ALL)
    }

    pub const fn bits(&self) -> i32 {
        self.0 as i32
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: HandleEvents) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HandleEvents {
    type Output = HandleEvents;

    fn bitor(self, rhs: Self) -> Self {
        HandleEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for HandleEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for HandleEvents {
    type Output = HandleEvents;

    fn bitand(self, rhs: Self) -> Self {
        HandleEvents(self.0 & rhs.0)
    }
}

impl fmt::Debug for HandleEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleEvents({})", self)
    }
}

impl fmt::Display for HandleEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names = [
            (HandleEvents::READABLE, "readable"),
            (HandleEvents::WRITABLE, "writable"),
            (HandleEvents::ERROR, "error"),
            (HandleEvents::HANGUP, "hangup"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

// =============================================================================
// ENTITIES AND CATEGORIES
// =============================================================================

/// Kind of managed entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Domain,
    StoragePool,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Domain => write!(f, "domain"),
            EntityKind::StoragePool => write!(f, "storage pool"),
        }
    }
}

/// Event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Lifecycle,
    Refresh,
}

/// The callbacks the runner installs on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationKind {
    DomainLifecycle,
    StoragePoolLifecycle,
    StoragePoolRefresh,
}

impl RegistrationKind {
    pub fn entity(&self) -> EntityKind {
        match self {
            RegistrationKind::DomainLifecycle => EntityKind::Domain,
            RegistrationKind::StoragePoolLifecycle | RegistrationKind::StoragePoolRefresh => {
                EntityKind::StoragePool
            }
        }
    }
}

impl fmt::Display for RegistrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationKind::DomainLifecycle => write!(f, "domain lifecycle"),
            RegistrationKind::StoragePoolLifecycle => write!(f, "storage pool lifecycle"),
            RegistrationKind::StoragePoolRefresh => write!(f, "storage pool refresh"),
        }
    }
}

// =============================================================================
// EVENT TYPES
// =============================================================================

/// Domain lifecycle event type (`virDomainEventType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventType {
    Defined,
    Undefined,
    Started,
    Suspended,
    Resumed,
    Stopped,
    Shutdown,
    PmSuspended,
    Crashed,
    Unknown(i32),
}

impl DomainEventType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => DomainEventType::Defined,
            1 => DomainEventType::Undefined,
            2 => DomainEventType::Started,
            3 => DomainEventType::Suspended,
            4 => DomainEventType::Resumed,
            5 => DomainEventType::Stopped,
            6 => DomainEventType::Shutdown,
            7 => DomainEventType::PmSuspended,
            8 => DomainEventType::Crashed,
            other => DomainEventType::Unknown(other),
        }
    }

    pub fn as_raw(&self) -> i32 {
        match self {
            DomainEventType::Defined => 0,
            DomainEventType::Undefined => 1,
            DomainEventType::Started => 2,
            DomainEventType::Suspended => 3,
            DomainEventType::Resumed => 4,
            DomainEventType::Stopped => 5,
            DomainEventType::Shutdown => 6,
            DomainEventType::PmSuspended => 7,
            DomainEventType::Crashed => 8,
            DomainEventType::Unknown(raw) => *raw,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEventType::Defined => "defined",
            DomainEventType::Undefined => "undefined",
            DomainEventType::Started => "started",
            DomainEventType::Suspended => "suspended",
            DomainEventType::Resumed => "resumed",
            DomainEventType::Stopped => "stopped",
            DomainEventType::Shutdown => "shutdown",
            DomainEventType::PmSuspended => "pmsuspended",
            DomainEventType::Crashed => "crashed",
            DomainEventType::Unknown(_) => "unknown",
        }
    }

    /// Name of the detail code refining this event type, if known.
    pub fn detail_name(&self, detail: i32) -> Option<&'static str> {
        let names: &[&str] = match self {
            DomainEventType::Defined => &["added", "updated", "renamed", "from snapshot"],
            DomainEventType::Undefined => &["removed", "renamed"],
            DomainEventType::Started => &["booted", "migrated", "restored", "from snapshot", "wakeup"],
            DomainEventType::Suspended => &[
                "paused",
                "migrated",
                "I/O error",
                "watchdog",
                "restored",
                "from snapshot",
                "API error",
                "postcopy",
                "postcopy failed",
            ],
            DomainEventType::Resumed => &["unpaused", "migrated", "from snapshot", "postcopy"],
            DomainEventType::Stopped => &[
                "shutdown",
                "destroyed",
                "crashed",
                "migrated",
                "saved",
                "failed",
                "from snapshot",
            ],
            DomainEventType::Shutdown => &["finished", "guest", "host"],
            DomainEventType::PmSuspended => &["memory", "disk"],
            DomainEventType::Crashed => &["panicked"],
            DomainEventType::Unknown(_) => &[],
        };
        usize::try_from(detail).ok().and_then(|i| names.get(i).copied())
    }
}

/// Storage pool lifecycle event type (`virStoragePoolEventLifecycleType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePoolEventType {
    Defined,
    Undefined,
    Started,
    Stopped,
    Created,
    Deleted,
    Unknown(i32),
}

impl StoragePoolEventType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => StoragePoolEventType::Defined,
            1 => StoragePoolEventType::Undefined,
            2 => StoragePoolEventType::Started,
            3 => StoragePoolEventType::Stopped,
            4 => StoragePoolEventType::Created,
            5 => StoragePoolEventType::Deleted,
            other => StoragePoolEventType::Unknown(other),
        }
    }

    pub fn as_raw(&self) -> i32 {
        match self {
            StoragePoolEventType::Defined => 0,
            StoragePoolEventType::Undefined => 1,
            StoragePoolEventType::Started => 2,
            StoragePoolEventType::Stopped => 3,
            StoragePoolEventType::Created => 4,
            StoragePoolEventType::Deleted => 5,
            StoragePoolEventType::Unknown(raw) => *raw,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoragePoolEventType::Defined => "defined",
            StoragePoolEventType::Undefined => "undefined",
            StoragePoolEventType::Started => "started",
            StoragePoolEventType::Stopped => "stopped",
            StoragePoolEventType::Created => "created",
            StoragePoolEventType::Deleted => "deleted",
            StoragePoolEventType::Unknown(_) => "unknown",
        }
    }
}

// =============================================================================
// RAW PAYLOADS AND IDENTITY
// =============================================================================

/// Length of a native entity identity buffer.
pub const RAW_IDENTITY_LEN: usize = 16;

/// Event payload as handed over by a driver, before identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntityEvent {
    /// Raw identity bytes; empty when the driver could not read them.
    pub identity: Vec<u8>,
    /// Native event type (zero for refresh events)
    pub event: i32,
    /// Native detail code (zero for refresh events)
    pub detail: i32,
}

impl RawEntityEvent {
    pub fn new(identity: impl Into<Vec<u8>>, event: i32, detail: i32) -> Self {
        Self {
            identity: identity.into(),
            event,
            detail,
        }
    }
}

/// Resolve a raw identity buffer to a UUID.
///
/// Returns `None` for buffers of the wrong length and for the nil UUID.
pub fn resolve_identity(raw: &[u8]) -> Option<Uuid> {
    let bytes: [u8; RAW_IDENTITY_LEN] = raw.try_into().ok()?;
    let id = Uuid::from_bytes(bytes);
    if id.is_nil() {
        None
    } else {
        Some(id)
    }
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Typed payload of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    DomainLifecycle { event: DomainEventType, detail: i32 },
    StoragePoolLifecycle { event: StoragePoolEventType, detail: i32 },
    StoragePoolRefresh,
}

impl EventPayload {
    pub fn entity(&self) -> EntityKind {
        match self {
            EventPayload::DomainLifecycle { .. } => EntityKind::Domain,
            EventPayload::StoragePoolLifecycle { .. } | EventPayload::StoragePoolRefresh => {
                EntityKind::StoragePool
            }
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            EventPayload::StoragePoolRefresh => EventCategory::Refresh,
            _ => EventCategory::Lifecycle,
        }
    }
}

/// An immutable record produced for each resolved native event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotification {
    /// Unique identifier of the entity the event refers to
    pub unique_id: Uuid,
    /// Typed event payload
    pub payload: EventPayload,
    /// When the callback fired
    pub received_at: DateTime<Utc>,
}

impl EventNotification {
    pub fn new(unique_id: Uuid, payload: EventPayload) -> Self {
        Self {
            unique_id,
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn entity(&self) -> EntityKind {
        self.payload.entity()
    }

    pub fn category(&self) -> EventCategory {
        self.payload.category()
    }

    /// Detail code refining the event type (zero for refresh events).
    pub fn detail(&self) -> i32 {
        match self.payload {
            EventPayload::DomainLifecycle { detail, .. } => detail,
            EventPayload::StoragePoolLifecycle { detail, .. } => detail,
            EventPayload::StoragePoolRefresh => 0,
        }
    }

    /// Short human readable description, e.g. `started (booted)`.
    pub fn describe(&self) -> String {
        match self.payload {
            EventPayload::DomainLifecycle { event, detail } => match event.detail_name(detail) {
                Some(name) => format!("{} ({})", event.name(), name),
                None => format!("{} (detail {})", event.name(), detail),
            },
            EventPayload::StoragePoolLifecycle { event, .. } => event.name().to_string(),
            EventPayload::StoragePoolRefresh => "refreshed".to_string(),
        }
    }
}

impl fmt::Display for EventNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.entity(), self.unique_id, self.describe())
    }
}
