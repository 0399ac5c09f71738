//! # virtloop Runtime
//!
//! Event loop bridge between libvirt's callback-driven event model and
//! Rust subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────┐        ┌──────────────────────────┐
//! │        EventRegistrar         │◀──────▶│   VirtDriver (native)    │
//! │ add/update/remove handle      │ slots  │  MockDriver │ Libvirt    │
//! │ add/update/remove timeout     │        └────────────┬─────────────┘
//! └───────────────────────────────┘                     │ callbacks
//!                                                       ▼
//! ┌───────────────────────────────┐        ┌──────────────────────────┐
//! │   EventLoopRunner (thread)    │──────▶ │ Connection subscribers   │
//! │ run_iteration → decode → queue│ FIFO   │ domains │ storage pools  │
//! └───────────────────────────────┘        └──────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use virtloop_runtime::{Connection, EventLoopRunner, EventRegistrar, MockDriver, RunnerOptions};
//!
//! # fn main() -> virtloop_runtime::Result<()> {
//! let driver = Arc::new(MockDriver::new());
//! EventRegistrar::global().install(driver.as_ref())?;
//!
//! let conn = Connection::open(driver, "mock:///default")?;
//! conn.subscribe_all(|event| println!("{}", event));
//!
//! let runner = EventLoopRunner::start(&conn, RunnerOptions::default())?;
//! // ...
//! conn.close()?;
//! runner.dispose();
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod libvirt;
pub mod mock;
pub mod registrar;
pub mod runner;
pub mod traits;
pub mod types;

pub use connection::{Connection, EventHandler, ShutdownSignal, SubscriberRegistry, SubscriptionId};
pub use error::{EventLoopError, Result};
pub use mock::{MockDriver, MockStats};
pub use registrar::{EventRegistrar, HandleWatchState, TimeoutWatchState};
pub use runner::{EventLoopRunner, LoopState, Registrations, RunnerOptions};
pub use traits::{EventImplMode, StoragePoolEventId, VirtDriver};
pub use types::*;

// Re-export libvirt driver when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtDriver;
