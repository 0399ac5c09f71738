//! # virtloop Common
//!
//! Shared utilities for the virtloop components.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use virtloop_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat};
