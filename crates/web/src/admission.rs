//! Tunnel admission
//!
//! Runs before the WebSocket upgrade. A request is admitted only when its VM
//! resolves to a display port and a worker slot is free; anything else is
//! refused without touching the network.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use crate::error::AdmissionError;
use crate::resolver::PortResolver;
use crate::session::Session;

/// Path prefix of the tunnel endpoint
pub const TUNNEL_PATH_PREFIX: &str = "/ws/vnc/";

/// An accepted tunnel request, ready to be upgraded
#[derive(Debug)]
pub struct Admitted {
    pub vm: String,
    pub port: u16,
    permit: OwnedSemaphorePermit,
}

impl Admitted {
    /// Start the session; the permit travels with it
    pub fn into_session(self) -> (Session, OwnedSemaphorePermit) {
        (Session::new(self.vm, self.port), self.permit)
    }
}

/// Gatekeeper for tunnel requests
pub struct Admission {
    resolver: Arc<dyn PortResolver>,
    slots: Arc<Semaphore>,
    max_sessions: usize,
}

impl Admission {
    pub fn new(resolver: Arc<dyn PortResolver>, max_sessions: usize) -> Self {
        Self {
            resolver,
            slots: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
        }
    }

    /// Tunnel slots currently free
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Decide whether a tunnel request for `path` may proceed
    pub async fn admit(&self, path: &str) -> Result<Admitted, AdmissionError> {
        let result = self.try_admit(path).await;

        match &result {
            Ok(admitted) => info!(
                vm = %admitted.vm,
                port = admitted.port,
                outcome = "accept",
                "VNC admission"
            ),
            Err(e) => info!(
                path,
                outcome = "reject",
                reason = e.reason(),
                "VNC admission"
            ),
        }

        result
    }

    async fn try_admit(&self, path: &str) -> Result<Admitted, AdmissionError> {
        let vm = vm_from_path(path)
            .ok_or_else(|| AdmissionError::MalformedRequestPath(path.to_string()))?;

        let port = self.resolver.resolve_port(vm).await?;

        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| AdmissionError::Busy)?;

        Ok(Admitted {
            vm: vm.to_string(),
            port,
            permit,
        })
    }
}

/// Extract the VM name: the single, non-empty segment after the prefix
pub fn vm_from_path(path: &str) -> Option<&str> {
    let vm = path.strip_prefix(TUNNEL_PATH_PREFIX)?;
    if vm.is_empty() || vm.contains('/') {
        return None;
    }
    Some(vm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolveError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeResolver {
        ports: HashMap<&'static str, Result<u16, ResolveError>>,
        calls: AtomicUsize,
    }

    impl FakeResolver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ports: HashMap::from([
                    ("alpha", Ok(5901)),
                    ("beta", Err(ResolveError::NoDisplayConfigured)),
                ]),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PortResolver for FakeResolver {
        async fn resolve_port(&self, vm: &str) -> Result<u16, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ports
                .get(vm)
                .cloned()
                .unwrap_or(Err(ResolveError::NotFound))
        }
    }

    #[test]
    fn test_vm_from_path() {
        assert_eq!(vm_from_path("/ws/vnc/alpha"), Some("alpha"));
        assert_eq!(vm_from_path("/ws/vnc/web-01.lab"), Some("web-01.lab"));
        assert_eq!(vm_from_path("/ws/vnc/"), None);
        assert_eq!(vm_from_path("/ws/vnc/a/b"), None);
        assert_eq!(vm_from_path("/ws/vnc"), None);
        assert_eq!(vm_from_path("/other/alpha"), None);
    }

    #[tokio::test]
    async fn test_admit_attaches_port() {
        let admission = Admission::new(FakeResolver::new(), 4);
        let admitted = admission.admit("/ws/vnc/alpha").await.unwrap();
        assert_eq!(admitted.vm, "alpha");
        assert_eq!(admitted.port, 5901);
        assert_eq!(admission.available_slots(), 3);

        let (session, permit) = admitted.into_session();
        assert_eq!(session.port, 5901);
        drop(permit);
        assert_eq!(admission.available_slots(), 4);
    }

    #[tokio::test]
    async fn test_malformed_path_skips_resolver() {
        let resolver = FakeResolver::new();
        let admission = Admission::new(resolver.clone(), 4);

        let err = admission.admit("/ws/vnc/").await.unwrap_err();
        assert!(matches!(err, AdmissionError::MalformedRequestPath(_)));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolution_failures_reject() {
        let admission = Admission::new(FakeResolver::new(), 4);

        let err = admission.admit("/ws/vnc/beta").await.unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::Unresolved(ResolveError::NoDisplayConfigured)
        ));

        let err = admission.admit("/ws/vnc/nope").await.unwrap_err();
        assert!(matches!(err, AdmissionError::Unresolved(ResolveError::NotFound)));
        assert_eq!(admission.available_slots(), 4);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_busy() {
        let admission = Admission::new(FakeResolver::new(), 1);

        let first = admission.admit("/ws/vnc/alpha").await.unwrap();
        let err = admission.admit("/ws/vnc/alpha").await.unwrap_err();
        assert!(matches!(err, AdmissionError::Busy));

        drop(first);
        assert!(admission.admit("/ws/vnc/alpha").await.is_ok());
    }
}
