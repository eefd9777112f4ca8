//! Web server implementation

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use vmconsole_common::{LibvirtRegistry, StaticRegistry, VmRegistry};

use crate::admission::{Admission, Admitted, TUNNEL_PATH_PREFIX};
use crate::bridge::{Dialer, TcpDialer};
use crate::config::{ConsoleConfig, RegistryConfig};
use crate::manager::BridgeManager;
use crate::resolver::{PortResolver, RegistryPortResolver};
use crate::session::{SessionEvent, SessionHandle};

/// Web server state
#[derive(Clone)]
pub struct WebServer {
    state: Arc<WebServerState>,
}

struct WebServerState {
    registry: Arc<dyn VmRegistry>,
    resolver: Arc<dyn PortResolver>,
    admission: Admission,
    manager: BridgeManager,
}

impl WebServer {
    /// Create a web server from configuration
    pub fn new(cfg: &ConsoleConfig) -> anyhow::Result<Self> {
        let registry: Arc<dyn VmRegistry> = match &cfg.registry {
            RegistryConfig::Libvirt { uri } => {
                info!("Using libvirt registry at {}", uri);
                Arc::new(LibvirtRegistry::new(uri.clone()))
            }
            RegistryConfig::Static { vms } => {
                info!("Using static registry with {} VMs", vms.len());
                let records = vms
                    .iter()
                    .map(|vm| vm.to_record())
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Arc::new(StaticRegistry::new(records))
            }
        };

        let dialer = Arc::new(TcpDialer::new(cfg.connect_timeout()));
        Ok(Self::with_parts(cfg, registry, dialer))
    }

    /// Create a web server around an existing registry and dialer
    pub fn with_parts(
        cfg: &ConsoleConfig,
        registry: Arc<dyn VmRegistry>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let resolver: Arc<dyn PortResolver> = Arc::new(RegistryPortResolver::new(
            registry.clone(),
            cfg.vnc_base_port,
        ));

        Self {
            state: Arc::new(WebServerState {
                registry,
                resolver: resolver.clone(),
                admission: Admission::new(resolver, cfg.max_sessions),
                manager: BridgeManager::new(cfg.display_host.clone(), dialer),
            }),
        }
    }

    /// Active tunnels
    pub fn manager(&self) -> &BridgeManager {
        &self.state.manager
    }

    /// Create router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health_handler))
            .route("/api/vms", get(list_vms_handler))
            .route("/api/vms/:vm_id/vnc", get(vnc_info_handler))
            .route("/api/sessions", get(list_sessions_handler))
            // VNC WebSocket tunnel; admission validates the VM segment
            .route("/ws/vnc/*vm_id", get(vnc_tunnel_handler))
            .fallback(not_found_handler)
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .with_state(self.state.clone())
    }

    /// Start the server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener, shutdown_signal()).await
    }

    /// Run on an already bound listener until `shutdown` resolves
    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        info!("Web console starting on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.state.manager.close_all().await;
        Ok(())
    }
}

/// Start the web server
pub async fn serve(cfg: ConsoleConfig) -> anyhow::Result<()> {
    let addr = cfg.listen;
    let server = WebServer::new(&cfg)?;
    server.serve(addr).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "vmconsole-web"
    }))
}

async fn list_vms_handler(State(state): State<Arc<WebServerState>>) -> Response {
    match state.registry.list_vms().await {
        Ok(vms) => {
            let vms: Vec<_> = vms
                .iter()
                .map(|vm| {
                    serde_json::json!({
                        "name": vm.name,
                        "state": vm.state,
                        "display": vm.display.map(|d| d.port.to_string()),
                        "websocket_path": format!("{}{}", TUNNEL_PATH_PREFIX, vm.name),
                    })
                })
                .collect();
            Json(serde_json::json!({ "vms": vms })).into_response()
        }
        Err(e) => {
            error!("Failed to list VMs: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": "registry unavailable" })),
            )
                .into_response()
        }
    }
}

async fn vnc_info_handler(
    State(state): State<Arc<WebServerState>>,
    Path(vm_id): Path<String>,
) -> Response {
    match state.resolver.resolve_port(&vm_id).await {
        Ok(port) => Json(serde_json::json!({
            "vm_id": vm_id,
            "vnc_port": port,
            "websocket_path": format!("{}{}", TUNNEL_PATH_PREFIX, vm_id),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.kind() })),
        )
            .into_response(),
    }
}

async fn list_sessions_handler(State(state): State<Arc<WebServerState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "sessions": state.manager.sessions(),
        "available_slots": state.admission.available_slots(),
        "max_sessions": state.admission.max_sessions(),
    }))
}

async fn vnc_tunnel_handler(
    State(state): State<Arc<WebServerState>>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    // Refused requests never reach the upgrade
    match state.admission.admit(uri.path()).await {
        Ok(admitted) => ws.on_upgrade(move |socket| run_tunnel(state, socket, admitted)),
        Err(e) => e.into_response(),
    }
}

async fn run_tunnel(state: Arc<WebServerState>, socket: WebSocket, admitted: Admitted) {
    let (session, permit) = admitted.into_session();
    let id = session.id;
    let manager = &state.manager;

    let (handle, mut events) = SessionHandle::channel(id);
    let (mut ws_write, mut ws_read) = socket.split();

    debug!("WebSocket session {} opened for {}", id, session.vm);
    manager.session_established(session, &handle, permit).await;

    let browser_to_vnc = async {
        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Binary(data)) => manager.session_received_frame(id, &data).await,
                Ok(Message::Text(_)) => {
                    // RFB is binary-only
                    debug!("Ignoring text frame on session {}", id);
                }
                Ok(Message::Close(_)) => {
                    debug!("WebSocket closed by client");
                    break;
                }
                // Ping/pong handled by axum
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Err(e) => {
                    debug!("WebSocket error on session {}: {}", id, e);
                    break;
                }
            }
        }
    };

    let vnc_to_browser = async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Frame(frame) => {
                    if let Err(e) = ws_write.send(Message::Binary(frame.to_vec())).await {
                        debug!("Failed to send to WebSocket: {}", e);
                        break;
                    }
                }
                SessionEvent::Close(code) => {
                    let _ = ws_write
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = browser_to_vnc => {}
        _ = vnc_to_browser => {}
    }

    manager.session_closed(id).await;
    drop(handle);
    debug!("WebSocket session {} ended", id);
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}
