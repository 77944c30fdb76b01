use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tunbridge::{Bridge, BridgeConfig};

/// Relays raw IP packets between a TUN device and local clients on a Unix
/// socket, using 4-byte big-endian length-prefixed frames.
#[derive(Parser, Debug)]
#[command(name = "tunbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TUN interface name [default: vpn0]
    interface: Option<String>,

    /// Path of the Unix socket clients connect to [default: /tmp/vpn-tun.sock]
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(name) = cli.interface {
        config.tun_name = name;
    }
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate()?;

    init_logging(&config.log_level);

    let mut bridge = Bridge::open(&config).context("failed to start bridge")?;

    let stop = bridge.stop_handle();
    for signal in [SIGINT, SIGTERM, SIGHUP] {
        flag::register(signal, Arc::clone(&stop))
            .with_context(|| format!("failed to register handler for signal {}", signal))?;
    }

    bridge.run()?;
    info!("Shut down cleanly");
    Ok(())
}

/// Initializes the tracing subscriber.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .ok();
}
