//! VmConsole web server

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vmconsole_web::ConsoleConfig;

#[derive(Parser)]
#[command(name = "vmconsole-web")]
#[command(about = "Browser consoles for KVM virtual machines over a WebSocket-to-VNC tunnel")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VMCONSOLE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long, env = "VMCONSOLE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Host the VNC display servers listen on
    #[arg(long, env = "VMCONSOLE_DISPLAY_HOST")]
    display_host: Option<String>,

    /// Maximum number of concurrent tunnels
    #[arg(long, env = "VMCONSOLE_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("VmConsole web v{}", vmconsole_common::VERSION);

    let config_path = cli
        .config
        .unwrap_or_else(vmconsole_common::default_config_path);
    let mut config = ConsoleConfig::load(&config_path)?;

    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(host) = cli.display_host {
        config.display_host = host;
    }
    if let Some(max) = cli.max_sessions {
        config.max_sessions = max;
    }

    info!(
        "Tunneling to displays on {} (max {} sessions)",
        config.display_host, config.max_sessions
    );

    vmconsole_web::server::serve(config).await
}
