//! VNC port resolution
//!
//! Maps a VM name to the TCP port its display server listens on. The answer
//! is recomputed for every admission so that a VM restarted on a different
//! display is reached on the next connection.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use vmconsole_common::{DisplayPort, VmRegistry};

use crate::error::ResolveError;

/// Resolves the display port of a VM
#[async_trait]
pub trait PortResolver: Send + Sync {
    async fn resolve_port(&self, vm: &str) -> Result<u16, ResolveError>;
}

/// Port resolver on top of a VM registry
pub struct RegistryPortResolver {
    registry: Arc<dyn VmRegistry>,
    vnc_base_port: u16,
}

impl RegistryPortResolver {
    pub fn new(registry: Arc<dyn VmRegistry>, vnc_base_port: u16) -> Self {
        Self {
            registry,
            vnc_base_port,
        }
    }
}

#[async_trait]
impl PortResolver for RegistryPortResolver {
    async fn resolve_port(&self, vm: &str) -> Result<u16, ResolveError> {
        let record = self
            .registry
            .lookup(vm)
            .await
            .map_err(|e| {
                warn!("Registry lookup for {} failed: {}", vm, e);
                ResolveError::Unavailable(e.to_string())
            })?
            .ok_or(ResolveError::NotFound)?;

        let display = record.display.ok_or(ResolveError::NoDisplayConfigured)?;

        match display.port {
            DisplayPort::Fixed(port) => Ok(port),
            // Auto-assigned ports only exist while the instance is live
            DisplayPort::Auto => match (record.is_running(), record.id) {
                (true, Some(id)) => u16::try_from(id)
                    .ok()
                    .and_then(|id| self.vnc_base_port.checked_add(id))
                    .ok_or_else(|| {
                        ResolveError::Unavailable(format!(
                            "auto port {} + {} out of range",
                            self.vnc_base_port, id
                        ))
                    }),
                _ => Err(ResolveError::NotRunning),
            },
        }
    }
}
