//! Robot command mediation layer
//!
//! Validates caller requests, routes them to registered robots, and drives
//! each one through a priority-ordered, retrying, cancellable execution
//! lifecycle with emergency-stop preemption.

pub mod config;
pub mod context;
pub mod events;
pub mod executor;
pub mod health;
pub mod intake;
pub mod plugins;
pub mod router;
pub mod transport;
pub mod validator;

pub use config::{ConfigError, McpConfig};
pub use context::McpContext;
pub use intake::IntakeServer;
