//! Server management - running and health checking the web server

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use vmconsole_common::VmRegistry;
use vmconsole_web::{BridgeManager, ConsoleConfig, Dialer, TcpDialer, WebServer};

use crate::error::{E2eError, E2eResult};

/// Handle to a web server running inside the test process
pub struct ServerHandle {
    server: WebServer,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
    pub base_url: String,
    pub port: u16,
}

impl ServerHandle {
    /// Start the web server on an ephemeral port
    pub async fn spawn(config: ServerConfig) -> E2eResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let base_url = format!("http://127.0.0.1:{}", port);

        info!("Starting web server on port {}", port);

        let console = ConsoleConfig {
            listen: listener.local_addr()?,
            display_host: config.display_host.clone(),
            max_sessions: config.max_sessions,
            ..Default::default()
        };
        let dialer: Arc<dyn Dialer> = match &config.dialer {
            Some(dialer) => dialer.clone(),
            None => Arc::new(TcpDialer::new(console.connect_timeout())),
        };
        let server = WebServer::with_parts(&console, config.registry.clone(), dialer);

        let (shutdown, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.clone().serve_with_listener(listener, async {
            let _ = stopped.await;
        }));

        let handle = ServerHandle {
            server,
            shutdown: Some(shutdown),
            task: Some(task),
            base_url: base_url.clone(),
            port,
        };

        handle.wait_for_healthy(config.startup_timeout).await?;

        info!("Server is healthy at {}", base_url);
        Ok(handle)
    }

    /// Wait for the server to respond to health checks
    async fn wait_for_healthy(&self, timeout_duration: Duration) -> E2eResult<()> {
        let health_url = format!("{}/api/health", self.base_url);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = std::time::Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            match client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => warn!("Health check returned {}", resp.status()),
                Err(e) if !e.is_connect() => warn!("Health check error: {}", e),
                Err(_) => {}
            }

            if self.task.as_ref().map_or(true, |t| t.is_finished()) {
                return Err(E2eError::ServerStartup("server task exited".to_string()));
            }

            sleep(Duration::from_millis(50)).await;
        }

        Err(E2eError::ServerHealthCheck(attempts))
    }

    /// Get the base URL for this server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket URL of a VM's tunnel
    pub fn tunnel_url(&self, vm: &str) -> String {
        format!("ws://127.0.0.1:{}/ws/vnc/{}", self.port, vm)
    }

    /// The server's tunnel table
    pub fn manager(&self) -> &BridgeManager {
        self.server.manager()
    }

    /// Wait until no tunnel is tracked any more
    pub async fn wait_for_idle(&self, within: Duration) -> E2eResult<()> {
        let start = std::time::Instant::now();
        while !self.manager().is_empty() {
            if start.elapsed() > within {
                return Err(E2eError::Timeout(format!(
                    "{} tunnels still open",
                    self.manager().len()
                )));
            }
            sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    /// Stop the server and wait for it to finish
    pub async fn stop(mut self) -> E2eResult<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(Duration::from_secs(5), task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(E2eError::ServerStartup(e.to_string())),
            Ok(Err(e)) => Err(E2eError::ServerStartup(e.to_string())),
            Err(_) => Err(E2eError::Timeout("server shutdown".to_string())),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Configuration for running a server
#[derive(Clone)]
pub struct ServerConfig {
    /// VM registry the console resolves against
    pub registry: Arc<dyn VmRegistry>,

    /// Dialer override; plain TCP when unset
    pub dialer: Option<Arc<dyn Dialer>>,

    /// Host the fake display servers listen on
    pub display_host: String,

    /// Tunnel slots
    pub max_sessions: usize,

    /// Timeout for server startup
    pub startup_timeout: Duration,
}

impl ServerConfig {
    pub fn new(registry: Arc<dyn VmRegistry>) -> Self {
        Self {
            registry,
            dialer: None,
            display_host: "127.0.0.1".to_string(),
            max_sessions: 8,
            startup_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }
}
