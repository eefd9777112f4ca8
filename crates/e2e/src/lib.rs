//! VmConsole E2E Test Framework
//!
//! Runs the console in-process on an ephemeral port and drives the VNC
//! tunnel with a real WebSocket client against fake display servers.
//!
//! ```text
//! tokio-tungstenite client ──ws──▶ WebServer ──tcp──▶ FakeVncServer
//! ```

pub mod display;
pub mod error;
pub mod server;

pub use display::{CountingDialer, FakeVncServer};
pub use error::{E2eError, E2eResult};
pub use server::{ServerConfig, ServerHandle};

/// Install a test subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
