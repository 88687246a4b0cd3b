//! gibridge: expose a TCP listener to a parent process over stdin/stdout.

mod acceptor;
mod config;
mod egress;
mod error;
mod ingress;
mod sink;
mod task_group;

pub mod bridge;
pub mod orchestrator;
pub mod registry;

pub use bridge::protocol::{Command, ConnId, Event, ProtocolError, Tag};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use orchestrator::{Bridge, SessionState};
pub use registry::ConnectionRegistry;

/// gibridge version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
