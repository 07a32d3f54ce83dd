//! Shared protocol types and codec
//!
//! This crate provides the command envelope, execution states, error
//! taxonomy and frame codec used between callers, the mediation layer and
//! robots.

pub mod codec;
pub mod protocol;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

pub use protocol::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default timing parameters
pub mod defaults {
    /// Robot heartbeat interval in milliseconds
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

    /// Missed-heartbeat window before a binding is marked unhealthy
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 5000;

    /// Emergency stop acknowledgement bound; shorter than any command timeout
    pub const ESTOP_ACK_TIMEOUT_MS: u64 = 75;

    /// Smallest accepted command timeout
    pub const MIN_COMMAND_TIMEOUT_MS: u64 = 100;

    /// Largest accepted command timeout
    pub const MAX_COMMAND_TIMEOUT_MS: u64 = 600_000;

    /// Maximum attempts per command, first attempt included
    pub const COMMAND_MAX_ATTEMPTS: u32 = 3;

    /// First retry backoff
    pub const RETRY_BACKOFF_BASE_MS: u64 = 100;

    /// Backoff ceiling
    pub const RETRY_BACKOFF_MAX_MS: u64 = 5000;

    /// How long terminal records are kept for idempotency checks
    pub const RECORD_RETENTION_MS: u64 = 600_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_estop_bound_shorter_than_commands() {
        assert!(defaults::ESTOP_ACK_TIMEOUT_MS < defaults::MIN_COMMAND_TIMEOUT_MS);
    }
}
