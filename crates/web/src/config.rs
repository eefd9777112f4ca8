//! Console configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use vmconsole_common::{DisplayPort, VmRecord, DEFAULT_LIBVIRT_URI};

/// Web console configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// HTTP listen address
    pub listen: SocketAddr,

    /// Host the VNC display servers listen on
    pub display_host: String,

    /// Maximum number of concurrent tunnels
    pub max_sessions: usize,

    /// TCP connect timeout towards display servers
    pub connect_timeout_secs: u64,

    /// Base port for auto-assigned VNC displays
    pub vnc_base_port: u16,

    /// Where VM metadata comes from
    pub registry: RegistryConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 6080)),
            display_host: "127.0.0.1".to_string(),
            max_sessions: 10,
            connect_timeout_secs: 10,
            vnc_base_port: 5900,
            registry: RegistryConfig::default(),
        }
    }
}

/// Registry backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum RegistryConfig {
    /// Query libvirt through virsh
    Libvirt {
        #[serde(default = "default_libvirt_uri")]
        uri: String,
    },
    /// Fixed list of VMs
    Static {
        #[serde(default)]
        vms: Vec<StaticVm>,
    },
}

fn default_libvirt_uri() -> String {
    DEFAULT_LIBVIRT_URI.to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::Libvirt {
            uri: default_libvirt_uri(),
        }
    }
}

/// A VM entry of the static registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticVm {
    pub name: String,
    /// Runtime instance id, used for auto-assigned ports
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub running: bool,
    /// VNC port; -1 means auto-assign on start, absent means no display
    #[serde(default)]
    pub display_port: Option<i32>,
}

impl StaticVm {
    /// Convert into a registry record
    pub fn to_record(&self) -> anyhow::Result<VmRecord> {
        let mut vm = VmRecord::new(&self.name);
        if let Some(raw) = self.display_port {
            let port = DisplayPort::from_raw(raw).ok_or_else(|| {
                anyhow::anyhow!("invalid display_port {} for VM {}", raw, self.name)
            })?;
            vm = vm.with_display(port);
        }
        if self.running {
            vm = vm.running(self.id.unwrap_or_default());
        }
        Ok(vm)
    }
}

impl ConsoleConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
