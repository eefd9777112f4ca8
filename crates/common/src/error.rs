//! Error types for VmConsole

use thiserror::Error;

/// Result type alias using VmConsole Error
pub type Result<T> = std::result::Result<T, Error>;

/// VmConsole error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Domain XML error: {0}")]
    DomainXml(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a missing VM
    pub fn vm_not_found(name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "vm".to_string(),
            id: name.into(),
        }
    }
}
