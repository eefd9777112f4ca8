//! VmConsole Web
//!
//! Serves VM consoles to the browser by tunneling VNC over WebSocket.

pub mod admission;
pub mod bridge;
pub mod config;
pub mod error;
pub mod manager;
pub mod resolver;
pub mod server;
pub mod session;

pub use admission::{Admission, Admitted};
pub use bridge::{BoxedStream, Dialer, StreamBridge, TcpDialer};
pub use config::{ConsoleConfig, RegistryConfig, StaticVm};
pub use error::{AdmissionError, DialError, ResolveError};
pub use manager::BridgeManager;
pub use resolver::{PortResolver, RegistryPortResolver};
pub use server::WebServer;
pub use session::{Session, SessionHandle, SessionId, SessionPhase};
