//! Error types for the event loop bridge.

use thiserror::Error;

use crate::runner::Registrations;
use crate::types::RegistrationKind;

/// Errors that can occur while setting up or driving the event loop.
#[derive(Error, Debug)]
pub enum EventLoopError {
    /// Failed to open a connection to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// The connection was already shut down.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Installing the event implementation with the native library failed.
    #[error("Failed to install event implementation: {0}")]
    EventImplFailed(String),

    /// The native library returned a negative registration id.
    ///
    /// `partial` holds the registrations that succeeded before the failure.
    /// They stay installed until released with [`Registrations::release`].
    #[error("Failed to register {kind} callback: {message}")]
    RegistrationFailed {
        kind: RegistrationKind,
        message: String,
        partial: Registrations,
    },

    /// One iteration of the native event loop failed.
    #[error("Event loop iteration failed: {0}")]
    IterationFailed(String),

    /// The background thread could not be spawned.
    #[error("Failed to spawn event loop thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for event loop operations.
pub type Result<T> = std::result::Result<T, EventLoopError>;
