//! VNC stream bridge
//!
//! Owns the TCP connection to one display server and pumps bytes between it
//! and a browser session. The bridge never interprets RFB; frames are opaque.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use axum::extract::ws::close_code;

use crate::error::DialError;
use crate::session::WeakSessionHandle;

/// Read chunk size for display -> browser traffic
const READ_BUFFER_SIZE: usize = 4096;

/// A byte stream to a display server
pub trait DisplayStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DisplayStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn DisplayStream>;

/// Opens connections to display servers
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, DialError>;
}

/// Plain TCP dialer with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, DialError> {
        let target = format!("{}:{}", host, port);
        debug!("Connecting to VNC server at {}", target);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| DialError::Timeout {
                target: target.clone(),
                seconds: self.connect_timeout.as_secs(),
            })?
            .map_err(|source| DialError::Connect {
                target: target.clone(),
                source,
            })?;

        // Interactive traffic: keystrokes and pointer events must not be batched
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", target, e);
        }

        Ok(Box::new(stream))
    }
}

/// Bridge lifecycle; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Connecting = 0,
    Connected = 1,
    Closed = 2,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BridgeState::Connecting,
            1 => BridgeState::Connected,
            _ => BridgeState::Closed,
        }
    }
}

/// One live display-server connection attached to one session
pub struct StreamBridge {
    target: String,
    state: AtomicU8,
    session: WeakSessionHandle,
    reader: parking_lot::Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    shutdown: CancellationToken,
}

impl StreamBridge {
    /// Dial the display server and attach the result to `session`
    pub async fn open(
        dialer: &dyn Dialer,
        host: &str,
        port: u16,
        session: WeakSessionHandle,
    ) -> Result<Arc<Self>, DialError> {
        let stream = dialer.dial(host, port).await?;
        let bridge = Self::attach(format!("{}:{}", host, port), stream, session);
        debug!("Session {} connected to {}", bridge.session.id(), bridge.target);
        Ok(bridge)
    }

    fn attach(target: String, stream: BoxedStream, session: WeakSessionHandle) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let bridge = Self {
            target,
            state: AtomicU8::new(BridgeState::Connecting as u8),
            session,
            reader: parking_lot::Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            shutdown: CancellationToken::new(),
        };
        bridge.transition(BridgeState::Connecting, BridgeState::Connected);
        Arc::new(bridge)
    }

    fn transition(&self, from: BridgeState, to: BridgeState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_live(&self) -> bool {
        self.state() == BridgeState::Connected
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Resolves once the bridge is closed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Forward display-server bytes to the browser until either side ends.
    ///
    /// Meant to run as its own task. Only the first call pumps; later calls
    /// return immediately.
    pub async fn pump_inbound(self: Arc<Self>) {
        let Some(mut reader) = self.reader.lock().take() else {
            return;
        };

        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                read = reader.read(&mut buffer) => read,
            };

            match read {
                Ok(0) => {
                    debug!("VNC server {} closed connection", self.target);
                    self.close().await;
                    self.session.request_close(close_code::NORMAL).await;
                    break;
                }
                Ok(n) => {
                    trace!("VNC->WS: {} bytes", n);
                    let frame = Bytes::copy_from_slice(&buffer[..n]);
                    // A full browser queue must not outlive close()
                    let sent = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        sent = self.session.send_frame(frame) => sent,
                    };
                    if sent.is_err() {
                        // Browser already left; expected during client disconnects
                        trace!("Session {} gone, stopping pump", self.session.id());
                        self.close().await;
                        break;
                    }
                }
                Err(e) => {
                    debug!("Read from VNC server {} failed: {}", self.target, e);
                    self.close().await;
                    self.session.request_close(close_code::ERROR).await;
                    break;
                }
            }
        }

        drop(reader);
        trace!("Inbound pump for {} finished", self.target);
    }

    /// Write browser bytes to the display server. No-op once closed.
    pub async fn send_outbound(&self, frame: &[u8]) {
        if !self.is_live() {
            return;
        }

        let failed = {
            let mut writer = self.writer.lock().await;
            let Some(w) = writer.as_mut() else {
                return;
            };

            trace!("WS->VNC: {} bytes", frame.len());
            let write = async {
                match w.write_all(frame).await {
                    Ok(()) => w.flush().await,
                    Err(e) => Err(e),
                }
            };
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                result = write => result.err(),
            }
        };

        if let Some(e) = failed {
            debug!("Write to VNC server {} failed: {}", self.target, e);
            self.close().await;
            self.session.request_close(close_code::ERROR).await;
        }
    }

    /// Close the bridge and release the socket. Idempotent.
    pub async fn close(&self) {
        if self.state.swap(BridgeState::Closed as u8, Ordering::AcqRel) == BridgeState::Closed as u8
        {
            return;
        }

        // Unblocks an in-flight read or write before the halves are taken
        self.shutdown.cancel();

        drop(self.reader.lock().take());
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        debug!("Bridge to {} closed", self.target);
    }
}
