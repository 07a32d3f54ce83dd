mod common;

use common::*;
use mcp_shared::{CommandResult, ErrorKind, ExecutionState};
use robot_mcp::events::{ChannelSink, EventKind, TracingSink};
use robot_mcp::transport::SimBehavior;
use robot_mcp::McpContext;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_primitive_succeeds_with_robot_payload() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", Some("rover"), &["drive"], SimBehavior::ack_after(5));
    ctx.start();

    let receipt = ctx.submit(&move_on("c-1", "rover-1")).await.unwrap();
    assert_eq!(receipt.state, ExecutionState::Queued);
    assert!(!receipt.duplicate);

    assert_eq!(finish(&ctx, "c-1").await, ExecutionState::Succeeded);
    let outcome = ctx.status("c-1").await.unwrap();
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.assigned_robot_id.as_deref(), Some("rover-1"));
    assert!(matches!(
        outcome.result,
        Some(CommandResult::Completed { ref payload }) if payload["action"] == "motion.move"
    ));
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_id_is_not_executed_twice() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::ack_after(5));
    ctx.start();

    ctx.submit(&move_on("c-dup", "rover-1")).await.unwrap();
    let again = ctx.submit(&move_on("c-dup", "rover-1")).await.unwrap();
    assert!(again.duplicate);

    assert_eq!(finish(&ctx, "c-dup").await, ExecutionState::Succeeded);
    let after = ctx.submit(&move_on("c-dup", "rover-1")).await.unwrap();
    assert!(after.duplicate);
    assert_eq!(after.state, ExecutionState::Succeeded);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(ctx.sim().deliveries().len(), 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_higher_priority_dispatches_first() {
    let ctx = context();
    ctx.add_sim_robot("arm-1", Some("arm"), &[], SimBehavior::ack_after(5));

    // Queued before any worker runs
    for (id, priority) in [("a", "low"), ("b", "normal"), ("c", "high")] {
        let raw = request(id, "system.status", json!("arm-1"), json!({}), 2_000, priority);
        ctx.submit(&raw).await.unwrap();
    }
    ctx.start();
    for id in ["a", "b", "c"] {
        assert_eq!(finish(&ctx, id).await, ExecutionState::Succeeded);
    }

    let order: Vec<String> = ctx
        .sim()
        .deliveries()
        .into_iter()
        .map(|d| d.command_id)
        .collect();
    assert_eq!(order, vec!["c", "b", "a"]);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_silent_robot_times_out_and_is_aborted() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::Silent);
    ctx.start();

    let raw = request("c-slow", "motion.move", json!("rover-1"), json!({ "distance_m": 1.0 }), 100, "normal");
    ctx.submit(&raw).await.unwrap();

    assert_eq!(finish(&ctx, "c-slow").await, ExecutionState::TimedOut);
    assert_eq!(error_of(&ctx, "c-slow").await.unwrap().kind, ErrorKind::Timeout);

    for _ in 0..50 {
        if !ctx.sim().aborted().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(ctx.sim().aborted(), vec!["c-slow".to_string()]);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_transient_faults_are_retried() {
    let ctx = context();
    ctx.add_sim_robot(
        "rover-1",
        None,
        &[],
        SimBehavior::FlakyThenAck {
            failures: 2,
            latency: Duration::from_millis(2),
        },
    );
    ctx.start();

    ctx.submit(&move_on("c-flaky", "rover-1")).await.unwrap();
    assert_eq!(finish(&ctx, "c-flaky").await, ExecutionState::Succeeded);
    assert_eq!(ctx.status("c-flaky").await.unwrap().attempts, 3);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let ctx = context();
    ctx.add_sim_robot(
        "rover-1",
        None,
        &[],
        SimBehavior::fault(ErrorKind::HardwareFault, "motor stalled"),
    );
    ctx.start();

    ctx.submit(&move_on("c-broken", "rover-1")).await.unwrap();
    assert_eq!(finish(&ctx, "c-broken").await, ExecutionState::Failed);
    assert_eq!(ctx.status("c-broken").await.unwrap().attempts, 3);

    let err = error_of(&ctx, "c-broken").await.unwrap();
    assert_eq!(err.kind, ErrorKind::HardwareFault);
    assert_eq!(err.message, "motor stalled");
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_non_retriable_fault_fails_at_once() {
    let ctx = context();
    ctx.add_sim_robot(
        "rover-1",
        None,
        &[],
        SimBehavior::fault(ErrorKind::ParamInvalid, "distance out of range for terrain"),
    );
    ctx.start();

    ctx.submit(&move_on("c-param", "rover-1")).await.unwrap();
    assert_eq!(finish(&ctx, "c-param").await, ExecutionState::Failed);
    assert_eq!(ctx.status("c-param").await.unwrap().attempts, 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_cancel_in_progress_command() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::Silent);
    ctx.start();

    ctx.submit(&move_on("c-cancel", "rover-1")).await.unwrap();
    assert!(wait_for_state(&ctx, "c-cancel", ExecutionState::InProgress).await);

    let outcome = ctx.cancel("c-cancel", "operator changed plan").await.unwrap();
    assert_eq!(outcome.state, ExecutionState::Cancelled);

    // Terminal states are final
    let again = ctx.cancel("c-cancel", "twice").await.unwrap();
    assert_eq!(again.state, ExecutionState::Cancelled);
    assert!(matches!(
        again.result,
        Some(CommandResult::Cancelled { ref reason }) if reason == "operator changed plan"
    ));
    assert!(ctx.cancel("c-unknown", "nothing").await.is_none());
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_cancel_queued_command_never_reaches_robot() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::ack_after(5));

    ctx.submit(&move_on("c-q", "rover-1")).await.unwrap();
    let outcome = ctx.cancel("c-q", "not needed").await.unwrap();
    assert_eq!(outcome.state, ExecutionState::Cancelled);

    ctx.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ctx.sim().deliveries().is_empty());
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_events_carry_caller_trace() {
    let (sink, mut events) = ChannelSink::new();
    let ctx = McpContext::new(test_config(), Arc::new(sink)).unwrap();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::ack_after(2));
    ctx.start();

    ctx.submit(&move_on("c-trace", "rover-1")).await.unwrap();
    assert_eq!(finish(&ctx, "c-trace").await, ExecutionState::Succeeded);
    ctx.shutdown().await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.correlation_id == "c-trace" {
            assert_eq!(event.trace_id, "trace-c-trace");
            kinds.push(event.kind);
        }
    }
    assert_eq!(kinds.first(), Some(&EventKind::ValidationPassed));
    assert!(kinds.contains(&EventKind::StateChanged {
        from: ExecutionState::InProgress,
        to: ExecutionState::Succeeded,
        attempts: 1,
    }));
}

#[tokio::test]
async fn test_submit_after_shutdown_is_refused() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::ack_after(2));
    ctx.start();
    ctx.shutdown().await;

    let err = ctx.submit(&move_on("c-late", "rover-1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
}

#[tokio::test]
async fn test_queued_command_times_out_while_robot_is_busy() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::Silent);

    // Both queue up; the first holds the robot's only slot once started
    let started = std::time::Instant::now();
    ctx.submit(&move_on("long", "rover-1")).await.unwrap();
    let short = request("short", "motion.move", json!("rover-1"), json!({ "distance_m": 1.0 }), 100, "normal");
    assert_eq!(ctx.submit(&short).await.unwrap().state, ExecutionState::Queued);
    ctx.start();
    assert!(wait_for_state(&ctx, "long", ExecutionState::InProgress).await);

    assert_eq!(finish(&ctx, "short").await, ExecutionState::TimedOut);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(error_of(&ctx, "short").await.unwrap().kind, ErrorKind::Timeout);
    assert_eq!(ctx.status("short").await.unwrap().attempts, 0);
    assert!(ctx.sim().deliveries().iter().all(|d| d.command_id != "short"));
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_evicted_id_can_be_submitted_again() {
    let config = robot_mcp::McpConfig {
        retention_ms: 50,
        ..test_config()
    };
    let ctx = McpContext::new(config, Arc::new(TracingSink)).unwrap();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::ack_after(1));
    ctx.start();

    ctx.submit(&move_on("c-1", "rover-1")).await.unwrap();
    assert_eq!(finish(&ctx, "c-1").await, ExecutionState::Succeeded);

    let mut evicted = false;
    for _ in 0..100 {
        if ctx.status("c-1").await.is_none() {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(evicted, "terminal record outlived its retention window");

    let receipt = ctx.submit(&move_on("c-1", "rover-1")).await.unwrap();
    assert!(!receipt.duplicate);
    assert_eq!(finish(&ctx, "c-1").await, ExecutionState::Succeeded);
    assert_eq!(ctx.sim().deliveries().len(), 2);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_default_config_accepts_short_timeouts() {
    let ctx = McpContext::new(robot_mcp::McpConfig::default(), Arc::new(TracingSink)).unwrap();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::Silent);
    ctx.start();

    let raw = request("quick", "motion.move", json!("rover-1"), json!({ "distance_m": 1.0 }), 100, "normal");
    ctx.submit(&raw).await.unwrap();
    assert_eq!(finish(&ctx, "quick").await, ExecutionState::TimedOut);
    ctx.shutdown().await;
}
