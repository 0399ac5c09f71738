//! # virtloop Event Monitor
//!
//! Opens a hypervisor connection, drives its event loop on a dedicated
//! thread and prints every domain and storage pool lifecycle event it
//! receives.
//!
//! ## Usage
//! ```bash
//! virtloop-monitor --uri qemu:///system
//! virtloop-monitor --dev --json
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;
use virtloop_common::LogFormat;
use virtloop_runtime::{
    Connection, DomainEventType, EventLoopRunner, EventNotification, EventRegistrar, LoopState,
    MockDriver, StoragePoolEventType, VirtDriver,
};

mod cli;
mod config;

use cli::Args;
use config::{Config, DriverKind, OutputFormat};

const DEFAULT_CONFIG_PATH: &str = "/etc/virtloop/monitor.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Configuration decides the log format, so load it before logging is up
    let (config, source) = load_config(&args)?;

    let log_format = match config.output.log_format.as_deref() {
        Some(format) => format.parse()?,
        None => LogFormat::default(),
    };
    virtloop_common::init_logging(&args.log_level, log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting virtloop Event Monitor"
    );
    match source {
        Some(path) => info!(config_path = %path, "Configuration loaded"),
        None => info!("No config file found, using CLI arguments and defaults"),
    }
    info!(
        uri = %config.connection.uri,
        driver = ?config.connection.driver,
        event_impl = ?config.connection.event_impl,
        "Monitor configured"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "Monitor failed");
        return Err(e);
    }

    Ok(())
}

/// Resolve the configuration and the file it came from, if any.
fn load_config(args: &Args) -> Result<(Config, Option<String>)> {
    let config = match &args.config {
        // Explicit config file must load
        Some(path) => {
            let cfg = Config::load(path)?.with_cli_overrides(args);
            (cfg, Some(path.clone()))
        }
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => (cfg.with_cli_overrides(args), Some(DEFAULT_CONFIG_PATH.to_string())),
            Err(_) => (Config::default_with_cli(args), None),
        },
    };

    config.0.validate()?;
    Ok(config)
}

/// Build the native driver selected by the configuration.
fn create_driver(config: &Config) -> Result<(Arc<dyn VirtDriver>, Option<Arc<MockDriver>>)> {
    match config.connection.driver {
        DriverKind::Mock => {
            info!("Using mock driver (development mode)");
            let mock = Arc::new(MockDriver::new());
            let driver: Arc<dyn VirtDriver> = mock.clone();
            Ok((driver, Some(mock)))
        }
        #[cfg(feature = "libvirt")]
        DriverKind::Libvirt => {
            info!("Using libvirt driver");
            let driver = virtloop_runtime::LibvirtDriver::new(config.connection.event_impl);
            Ok((Arc::new(driver), None))
        }
        #[cfg(not(feature = "libvirt"))]
        DriverKind::Libvirt => anyhow::bail!(
            "libvirt support not compiled in; rebuild with --features libvirt or use --dev"
        ),
    }
}

async fn run(config: Config) -> Result<()> {
    let (driver, mock) = create_driver(&config)?;

    // The event implementation has to be in place before the first connection
    EventRegistrar::global()
        .install(driver.as_ref())
        .context("Failed to install event implementation")?;

    let uri = config.connection.uri.clone();
    let conn = tokio::task::spawn_blocking(move || Connection::open(driver, &uri))
        .await
        .context("Connection task panicked")?
        .context("Failed to open connection")?;

    let filter = config
        .output
        .filter
        .as_deref()
        .map(Uuid::parse_str)
        .transpose()
        .context("Invalid filter UUID")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = conn.subscribe_all(move |notification: &EventNotification| {
        if filter.map_or(true, |id| id == notification.unique_id) {
            let _ = tx.send(notification.clone());
        }
    });

    let runner = EventLoopRunner::start(&conn, config.runner_options())
        .context("Failed to start event loop")?;
    info!(registrations = ?runner.registrations(), "Listening for events");

    let generator = mock.map(|mock| tokio::spawn(generate_synthetic_events(mock)));

    let mut health = tokio::time::interval(Duration::from_secs(1));
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            received = rx.recv() => match received {
                Some(notification) => print_event(&notification, config.output.format),
                None => break,
            },
            _ = health.tick() => {
                if runner.state() == LoopState::Failed {
                    let message = runner.last_error().unwrap_or_default();
                    outcome = Err(anyhow::anyhow!("Event loop failed: {}", message));
                    break;
                }
            }
        }
    }

    if let Some(task) = generator {
        task.abort();
    }
    conn.unsubscribe(subscription);

    // Closing waits for the loop thread, which may take up to the join timeout
    let closing = Arc::clone(&conn);
    match tokio::task::spawn_blocking(move || closing.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Connection did not close cleanly"),
        Err(e) => warn!(error = %e, "Close task panicked"),
    }
    runner.dispose();

    info!(state = ?runner.state(), "Event monitor stopped");
    outcome
}

fn print_event(notification: &EventNotification, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            println!("{} {}", notification.received_at.to_rfc3339(), notification);
        }
        OutputFormat::Json => match serde_json::to_string(notification) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to serialize event"),
        },
    }
}

/// Cycle a few fake domains and a storage pool through their lifecycles.
async fn generate_synthetic_events(mock: Arc<MockDriver>) {
    const DOMAIN_CYCLE: [(DomainEventType, i32); 4] = [
        (DomainEventType::Started, 0),
        (DomainEventType::Suspended, 0),
        (DomainEventType::Resumed, 0),
        (DomainEventType::Stopped, 0),
    ];

    let domains = [Uuid::new_v4(), Uuid::new_v4()];
    let pool = Uuid::new_v4();
    let mut interval = tokio::time::interval(Duration::from_secs(2));
    let mut step = 0usize;

    mock.emit_storage_pool_event(pool, StoragePoolEventType::Started);

    loop {
        interval.tick().await;

        let domain = domains[step % domains.len()];
        let (event, detail) = DOMAIN_CYCLE[(step / domains.len()) % DOMAIN_CYCLE.len()];
        mock.emit_domain_event(domain.as_bytes(), event, detail);

        if step % 5 == 4 {
            mock.emit_storage_pool_refresh(pool);
        }
        step += 1;
    }
}
