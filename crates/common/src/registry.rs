//! VM registry access
//!
//! The console only needs to enumerate VMs and look one up by name. Two
//! backends exist: a static, configuration-driven registry and a libvirt
//! registry that talks to `virsh`.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::domain_xml::parse_domain_xml;
use crate::error::{Error, Result};
use crate::types::{VmRecord, VmState};

/// Read-only view of the VMs known to the hypervisor
#[async_trait]
pub trait VmRegistry: Send + Sync {
    /// List every defined VM, running or not
    async fn list_vms(&self) -> Result<Vec<VmRecord>>;

    /// Look up a VM by name; `Ok(None)` when no such VM is defined
    async fn lookup(&self, name: &str) -> Result<Option<VmRecord>>;
}

/// In-memory registry, populated from configuration
#[derive(Debug, Default)]
pub struct StaticRegistry {
    vms: RwLock<BTreeMap<String, VmRecord>>,
}

impl StaticRegistry {
    pub fn new(vms: impl IntoIterator<Item = VmRecord>) -> Self {
        Self {
            vms: RwLock::new(vms.into_iter().map(|vm| (vm.name.clone(), vm)).collect()),
        }
    }

    /// Insert or replace a VM record
    pub fn upsert(&self, vm: VmRecord) {
        debug!("Registry upsert: {} ({})", vm.name, vm.state);
        self.vms.write().insert(vm.name.clone(), vm);
    }

    /// Remove a VM record
    pub fn remove(&self, name: &str) -> Result<VmRecord> {
        self.vms
            .write()
            .remove(name)
            .ok_or_else(|| Error::vm_not_found(name))
    }
}

#[async_trait]
impl VmRegistry for StaticRegistry {
    async fn list_vms(&self) -> Result<Vec<VmRecord>> {
        Ok(self.vms.read().values().cloned().collect())
    }

    async fn lookup(&self, name: &str) -> Result<Option<VmRecord>> {
        Ok(self.vms.read().get(name).cloned())
    }
}

/// Registry backed by the libvirt `virsh` CLI
#[derive(Debug, Clone)]
pub struct LibvirtRegistry {
    uri: String,
    virsh: String,
}

impl LibvirtRegistry {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            virsh: "virsh".to_string(),
        }
    }

    /// Use a different `virsh` binary
    pub fn with_binary(mut self, virsh: impl Into<String>) -> Self {
        self.virsh = virsh.into();
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Run a read-only virsh command; `Ok(None)` when the domain does not exist
    async fn virsh(&self, args: &[&str]) -> Result<Option<String>> {
        trace!("virsh -c {} {}", self.uri, args.join(" "));

        let output = Command::new(&self.virsh)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Registry(format!("failed to run {}: {}", self.virsh, e)))?;

        if output.status.success() {
            return Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_domain(&stderr) {
            return Ok(None);
        }

        Err(Error::Registry(format!(
            "virsh {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )))
    }
}

/// virsh reports unknown domains as "failed to get domain" / VIR_ERR_NO_DOMAIN
fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

#[async_trait]
impl VmRegistry for LibvirtRegistry {
    async fn list_vms(&self) -> Result<Vec<VmRecord>> {
        let names = self
            .virsh(&["list", "--all", "--name"])
            .await?
            .unwrap_or_default();

        let mut vms = Vec::new();
        for name in names.lines().map(str::trim).filter(|n| !n.is_empty()) {
            // A domain can be undefined between the listing and the lookup
            if let Some(vm) = self.lookup(name).await? {
                vms.push(vm);
            }
        }
        Ok(vms)
    }

    async fn lookup(&self, name: &str) -> Result<Option<VmRecord>> {
        let Some(xml) = self.virsh(&["dumpxml", name]).await? else {
            return Ok(None);
        };

        let info = parse_domain_xml(&xml)?;
        let state = if info.id.is_some() {
            VmState::Running
        } else {
            VmState::Stopped
        };

        Ok(Some(VmRecord {
            name: name.to_string(),
            id: info.id,
            state,
            display: info.display,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DisplayPort;

    #[tokio::test]
    async fn test_static_lookup() {
        let registry = StaticRegistry::new([
            VmRecord::new("alpha").with_display(DisplayPort::Fixed(5901)).running(1),
            VmRecord::new("beta"),
        ]);

        let alpha = registry.lookup("alpha").await.unwrap().unwrap();
        assert!(alpha.is_running());
        assert!(registry.lookup("gamma").await.unwrap().is_none());
        assert_eq!(registry.list_vms().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_static_upsert_and_remove() {
        let registry = StaticRegistry::default();
        registry.upsert(VmRecord::new("alpha"));
        registry.upsert(VmRecord::new("alpha").running(4));

        let alpha = registry.lookup("alpha").await.unwrap().unwrap();
        assert_eq!(alpha.id, Some(4));

        registry.remove("alpha").unwrap();
        assert!(matches!(
            registry.remove("alpha"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_missing_domain_detection() {
        assert!(is_missing_domain(
            "error: failed to get domain 'nope'\nerror: Domain not found"
        ));
        assert!(!is_missing_domain("error: failed to connect to the hypervisor"));
    }

    #[tokio::test]
    async fn test_libvirt_missing_binary() {
        let registry = LibvirtRegistry::new("qemu:///system")
            .with_binary("/nonexistent/virsh-for-tests");
        let err = registry.lookup("alpha").await.unwrap_err();
        assert!(matches!(err, Error::Registry(_)));
    }
}
