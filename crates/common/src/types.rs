//! Core types for VmConsole

use serde::{Deserialize, Serialize};

/// VM state as reported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Running,
    Stopped,
}

impl Default for VmState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Running => write!(f, "running"),
            VmState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Port of a VM's VNC display server as stored in its configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "port")]
pub enum DisplayPort {
    /// Fixed TCP port
    Fixed(u16),
    /// Assigned by the hypervisor when the VM starts
    Auto,
}

impl DisplayPort {
    /// Sentinel used by libvirt (and our config files) for "auto-assign on start"
    pub const AUTO_SENTINEL: i32 = -1;

    /// Interpret a raw configured port value
    pub fn from_raw(port: i32) -> Option<Self> {
        if port == Self::AUTO_SENTINEL {
            return Some(DisplayPort::Auto);
        }
        u16::try_from(port).ok().map(DisplayPort::Fixed)
    }
}

impl std::fmt::Display for DisplayPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisplayPort::Fixed(port) => write!(f, "{}", port),
            DisplayPort::Auto => write!(f, "auto"),
        }
    }
}

/// Display server stanza of a VM configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub port: DisplayPort,
}

/// A VM as seen by the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    /// Runtime instance index, only present while the VM is active
    pub id: Option<u32>,
    pub state: VmState,
    pub display: Option<DisplayConfig>,
}

impl VmRecord {
    /// A stopped VM without any display stanza
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            state: VmState::Stopped,
            display: None,
        }
    }

    pub fn with_display(mut self, port: DisplayPort) -> Self {
        self.display = Some(DisplayConfig { port });
        self
    }

    pub fn running(mut self, id: u32) -> Self {
        self.id = Some(id);
        self.state = VmState::Running;
        self
    }

    pub fn is_running(&self) -> bool {
        self.state == VmState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_port_from_raw() {
        assert_eq!(DisplayPort::from_raw(-1), Some(DisplayPort::Auto));
        assert_eq!(DisplayPort::from_raw(5901), Some(DisplayPort::Fixed(5901)));
        assert_eq!(DisplayPort::from_raw(70000), None);
        assert_eq!(DisplayPort::from_raw(-2), None);
    }

    #[test]
    fn test_record_builder() {
        let vm = VmRecord::new("alpha")
            .with_display(DisplayPort::Fixed(5901))
            .running(3);
        assert!(vm.is_running());
        assert_eq!(vm.id, Some(3));
        assert_eq!(vm.display.map(|d| d.port), Some(DisplayPort::Fixed(5901)));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&VmState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
