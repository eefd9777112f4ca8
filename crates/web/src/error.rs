//! Tunnel error taxonomy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Why a VM's display port could not be determined
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("VM not found")]
    NotFound,

    #[error("VM has no VNC display configured")]
    NoDisplayConfigured,

    #[error("VM display port is auto-assigned and the VM is not running")]
    NotRunning,

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

impl ResolveError {
    /// Short machine-readable kind, used in logs and the info API
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::NotFound => "not_found",
            ResolveError::NoDisplayConfigured => "no_display_configured",
            ResolveError::NotRunning => "not_running",
            ResolveError::Unavailable(_) => "unavailable",
        }
    }
}

/// Reasons a tunnel request is refused before the upgrade
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("malformed tunnel path: {0}")]
    MalformedRequestPath(String),

    #[error(transparent)]
    Unresolved(#[from] ResolveError),

    #[error("all tunnel slots are in use")]
    Busy,
}

impl AdmissionError {
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::MalformedRequestPath(_) => "malformed_path",
            AdmissionError::Unresolved(e) => e.kind(),
            AdmissionError::Busy => "busy",
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        // Nothing about the VM leaks to the browser
        match self {
            AdmissionError::Busy => {
                (StatusCode::SERVICE_UNAVAILABLE, "console busy").into_response()
            }
            _ => (StatusCode::FORBIDDEN, "console unavailable").into_response(),
        }
    }
}

/// Failure to reach a display server
#[derive(Error, Debug)]
pub enum DialError {
    #[error("connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {target} timed out after {seconds}s")]
    Timeout { target: String, seconds: u64 },
}
