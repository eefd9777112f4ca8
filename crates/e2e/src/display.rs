//! Fake display servers and dial accounting

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use vmconsole_web::{BoxedStream, DialError, Dialer, TcpDialer};

use crate::error::{E2eError, E2eResult};

/// A TCP listener standing in for a VM's VNC server
pub struct FakeVncServer {
    port: u16,
    accepted: Arc<AtomicUsize>,
    connections: mpsc::UnboundedReceiver<TcpStream>,
    task: JoinHandle<()>,
}

impl FakeVncServer {
    /// Listen on an ephemeral loopback port
    pub async fn start() -> E2eResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (tx, connections) = mpsc::unbounded_channel();

        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("Fake VNC server on {} accepted {}", port, peer);
                counter.fetch_add(1, Ordering::SeqCst);
                if tx.send(stream).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            port,
            accepted,
            connections,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Wait for the next tunnel connection
    pub async fn accept(&mut self, within: Duration) -> E2eResult<TcpStream> {
        tokio::time::timeout(within, self.connections.recv())
            .await
            .map_err(|_| E2eError::Timeout(format!("connection on port {}", self.port)))?
            .ok_or_else(|| E2eError::ServerStartup("fake VNC listener stopped".to_string()))
    }
}

impl Drop for FakeVncServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// TCP dialer that records how often it was asked to dial
pub struct CountingDialer {
    inner: TcpDialer,
    calls: AtomicUsize,
}

impl CountingDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: TcpDialer::new(Duration::from_secs(2)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, DialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(host, port).await
    }
}

/// A loopback port nothing listens on
pub async fn closed_port() -> E2eResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}
