//! Configuration management for the event monitor.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use virtloop_runtime::{EventImplMode, RunnerOptions};

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Event loop tunables
    pub event_loop: EventLoopConfig,
    /// Output configuration
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Create configuration from defaults and CLI arguments only.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref uri) = args.uri {
            self.connection.uri = uri.clone();
        }

        if args.dev {
            self.connection.driver = DriverKind::Mock;
        }

        if args.json {
            self.output.format = OutputFormat::Json;
        }

        if let Some(ref filter) = args.filter {
            self.output.filter = Some(filter.clone());
        }

        if let Some(secs) = args.join_timeout_secs {
            self.event_loop.join_timeout_secs = secs;
        }

        self
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.connection.uri.trim().is_empty() {
            anyhow::bail!("connection.uri must not be empty");
        }
        if self.event_loop.liveness_poll_ms == 0 {
            anyhow::bail!("event_loop.liveness_poll_ms must be greater than zero");
        }
        if let Some(ref filter) = self.output.filter {
            uuid::Uuid::parse_str(filter)
                .with_context(|| format!("output.filter is not a UUID: {}", filter))?;
        }
        Ok(())
    }

    /// Runner options derived from the event loop section.
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            join_timeout: Duration::from_secs(self.event_loop.join_timeout_secs),
            liveness_poll: Duration::from_millis(self.event_loop.liveness_poll_ms),
            thread_name: self.event_loop.thread_name.clone(),
        }
    }
}

/// Which native driver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-memory driver emitting synthetic events
    Mock,
    /// libvirt (requires the `libvirt` feature)
    Libvirt,
}

/// Connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connection URI
    pub uri: String,
    /// Native driver
    pub driver: DriverKind,
    /// Event implementation installed with the native library
    pub event_impl: EventImplMode,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            driver: DriverKind::Libvirt,
            event_impl: EventImplMode::Default,
        }
    }
}

/// Event loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Bound on waiting for the loop thread at shutdown
    pub join_timeout_secs: u64,
    /// Back-off while the connection is not alive
    pub liveness_poll_ms: u64,
    /// Name of the loop thread
    pub thread_name: String,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        let defaults = RunnerOptions::default();
        Self {
            join_timeout_secs: defaults.join_timeout.as_secs(),
            liveness_poll_ms: defaults.liveness_poll.as_millis() as u64,
            thread_name: defaults.thread_name,
        }
    }
}

/// Output format for printed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Event line format
    pub format: OutputFormat,
    /// Log line format (pretty, json)
    pub log_format: Option<String>,
    /// Only print events for this UUID
    pub filter: Option<String>,
}
