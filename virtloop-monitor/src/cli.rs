//! Command-line argument parsing.

use clap::Parser;

/// virtloop Event Monitor - prints libvirt domain and storage pool events
#[derive(Parser, Debug)]
#[command(name = "virtloop-monitor")]
#[command(about = "virtloop Event Monitor - prints libvirt domain and storage pool events")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Libvirt connection URI (e.g., qemu:///system)
    #[arg(long, env = "LIBVIRT_DEFAULT_URI")]
    pub uri: Option<String>,

    /// Enable development mode (mock driver with synthetic events)
    #[arg(long)]
    pub dev: bool,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Only print events for this domain or storage pool UUID
    #[arg(long)]
    pub filter: Option<String>,

    /// Seconds to wait for the event loop thread on shutdown
    #[arg(long)]
    pub join_timeout_secs: Option<u64>,
}
