//! VmConsole Common Library
//!
//! Shared types, errors and VM registry access for the console.

pub mod domain_xml;
pub mod error;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use registry::{LibvirtRegistry, StaticRegistry, VmRegistry};
pub use types::*;

/// VmConsole version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default libvirt connection URI
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

/// Default store path for configuration
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".vmconsole")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
