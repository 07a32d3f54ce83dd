#![allow(dead_code)]

use mcp_shared::{CommandError, ExecutionState};
use robot_mcp::events::TracingSink;
use robot_mcp::{McpConfig, McpContext};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const TOKEN: &str = "Bearer test-token-0123456789abcdef";

/// Tight timings so lifecycle tests finish quickly
pub fn test_config() -> McpConfig {
    McpConfig {
        workers: 2,
        min_timeout_ms: 50,
        estop_ack_timeout_ms: 40,
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        sweep_interval_ms: 20,
        heartbeat_timeout_ms: 60_000,
        health_check_interval_ms: 1_000,
        ..Default::default()
    }
}

pub fn context() -> McpContext {
    McpContext::new(test_config(), Arc::new(TracingSink)).unwrap()
}

pub fn request(id: &str, command_type: &str, target: Value, params: Value, timeout_ms: u64, priority: &str) -> Value {
    json!({
        "trace_id": format!("trace-{}", id),
        "timestamp": 1_700_000_000_000u64,
        "actor": { "type": "user", "id": "operator-1" },
        "source": "test",
        "auth_token": TOKEN,
        "command": {
            "id": id,
            "type": command_type,
            "target": target,
            "params": params,
            "timeout_ms": timeout_ms,
            "priority": priority,
        }
    })
}

/// A one-metre move on a named robot
pub fn move_on(id: &str, robot_id: &str) -> Value {
    request(id, "motion.move", json!(robot_id), json!({ "distance_m": 1.0 }), 2_000, "normal")
}

pub fn stop(id: &str, target: Value) -> Value {
    json!({
        "trace_id": format!("trace-{}", id),
        "timestamp": 1_700_000_000_000u64,
        "actor": { "type": "user", "id": "operator-1" },
        "source": "test",
        "auth_token": TOKEN,
        "command": {
            "id": id,
            "type": "system.emergency_stop",
            "target": target,
            "params": { "reason": "test" },
        }
    })
}

pub async fn state_of(ctx: &McpContext, id: &str) -> Option<ExecutionState> {
    ctx.status(id).await.map(|o| o.state)
}

pub async fn error_of(ctx: &McpContext, id: &str) -> Option<CommandError> {
    ctx.executor()
        .record(id)
        .await
        .and_then(|r| r.error().cloned())
}

/// Poll until a record reaches `state`
pub async fn wait_for_state(ctx: &McpContext, id: &str, state: ExecutionState) -> bool {
    for _ in 0..200 {
        if state_of(ctx, id).await == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

pub async fn finish(ctx: &McpContext, id: &str) -> ExecutionState {
    ctx.wait(id, Duration::from_secs(5))
        .await
        .map(|o| o.state)
        .unwrap_or_else(|| panic!("{} unknown", id))
}
