mod common;

use common::*;
use mcp_shared::{CommandResult, ErrorKind, ExecutionState, EMERGENCY_STOP};
use robot_mcp::transport::SimBehavior;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_stop_all_cancels_work_and_reports_unconfirmed_robot() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::Silent);
    ctx.add_sim_robot("rover-2", None, &[], SimBehavior::Silent);
    ctx.sim().set_behavior("rover-1", EMERGENCY_STOP, SimBehavior::ack_after(1));
    ctx.start();

    ctx.submit(&move_on("m-1", "rover-1")).await.unwrap();
    ctx.submit(&move_on("m-2", "rover-2")).await.unwrap();
    assert!(wait_for_state(&ctx, "m-1", ExecutionState::InProgress).await);
    assert!(wait_for_state(&ctx, "m-2", ExecutionState::InProgress).await);

    let receipt = ctx.submit(&stop("stop-all", json!("all"))).await.unwrap();
    assert!(!receipt.duplicate);

    assert_eq!(state_of(&ctx, "m-1").await, Some(ExecutionState::Cancelled));
    assert_eq!(state_of(&ctx, "m-2").await, Some(ExecutionState::Cancelled));

    assert_eq!(finish(&ctx, "stop-all").await, ExecutionState::Failed);
    let err = error_of(&ctx, "stop-all").await.unwrap();
    assert_eq!(err.kind, ErrorKind::EstopFailed);
    assert!(err.message.contains("rover-2"));
    assert!(!err.message.contains("rover-1:"));
    assert_eq!(ctx.status("stop-all").await.unwrap().attempts, 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_stop_succeeds_when_every_robot_acks() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::ack_after(1));
    ctx.add_sim_robot("rover-2", None, &[], SimBehavior::ack_after(1));
    ctx.router().mark_unhealthy("rover-2", "heartbeat timeout");
    ctx.start();

    ctx.submit(&stop("stop-1", json!("all"))).await.unwrap();
    assert_eq!(finish(&ctx, "stop-1").await, ExecutionState::Succeeded);

    // Unhealthy robots are still told to stop
    match ctx.status("stop-1").await.unwrap().result {
        Some(CommandResult::Completed { payload }) => {
            assert_eq!(payload["stopped"], json!(["rover-1", "rover-2"]))
        }
        other => panic!("unexpected result {:?}", other),
    }
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_queue_waits_behind_stop() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::ack_after(1));
    ctx.sim().set_behavior("rover-1", EMERGENCY_STOP, SimBehavior::ack_after(20));
    ctx.start();

    ctx.submit(&stop("stop-r1", json!("rover-1"))).await.unwrap();
    ctx.submit(&move_on("m-after", "rover-1")).await.unwrap();

    assert_eq!(finish(&ctx, "stop-r1").await, ExecutionState::Succeeded);
    assert_eq!(finish(&ctx, "m-after").await, ExecutionState::Succeeded);

    let deliveries = ctx.sim().deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].command_id, "stop-r1");
    assert_eq!(deliveries[1].command_id, "m-after");
    assert!(deliveries[1].at.duration_since(deliveries[0].at) >= Duration::from_millis(20));
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_stop_cannot_be_cancelled_by_caller() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::Silent);
    ctx.start();

    ctx.submit(&stop("stop-x", json!("rover-1"))).await.unwrap();
    let outcome = ctx.cancel("stop-x", "changed my mind").await.unwrap();
    assert_ne!(outcome.state, ExecutionState::Cancelled);
    assert_eq!(finish(&ctx, "stop-x").await, ExecutionState::Failed);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_stop_with_no_robots_is_offline() {
    let ctx = context();
    ctx.start();
    let err = ctx.submit(&stop("stop-none", json!("all"))).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RobotOffline);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_safety_violation_escalates_to_stop() {
    let ctx = context();
    ctx.add_sim_robot("arm-1", Some("arm"), &[], SimBehavior::ack_after(1));
    ctx.sim().set_behavior(
        "arm-1",
        "actuator.set",
        SimBehavior::fault(ErrorKind::SafetyViolation, "torque limit exceeded"),
    );
    ctx.start();

    let raw = request(
        "a-1",
        "actuator.set",
        json!("arm-1"),
        json!({ "actuator": "gripper", "value": 40.0 }),
        2_000,
        "normal",
    );
    ctx.submit(&raw).await.unwrap();
    assert_eq!(finish(&ctx, "a-1").await, ExecutionState::Failed);
    assert_eq!(error_of(&ctx, "a-1").await.unwrap().kind, ErrorKind::SafetyViolation);
    assert_eq!(ctx.status("a-1").await.unwrap().attempts, 1);

    let mut escalated = None;
    for _ in 0..100 {
        escalated = ctx.status("a-1.estop").await;
        if escalated.as_ref().map(|o| o.state.is_terminal()).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let escalated = escalated.expect("no escalation record");
    assert_eq!(escalated.state, ExecutionState::Succeeded);
    assert_eq!(escalated.trace_id, "trace-a-1");
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_emergency_priority_preempts_normal_work() {
    let ctx = context();
    ctx.add_sim_robot("rover-1", None, &[], SimBehavior::Silent);
    ctx.sim().set_behavior("rover-1", "motion.stop", SimBehavior::ack_after(1));
    ctx.start();

    ctx.submit(&move_on("m-1", "rover-1")).await.unwrap();
    assert!(wait_for_state(&ctx, "m-1", ExecutionState::InProgress).await);

    let urgent = request("halt", "motion.stop", json!("rover-1"), json!({}), 1_000, "emergency");
    ctx.submit(&urgent).await.unwrap();
    assert_eq!(state_of(&ctx, "m-1").await, Some(ExecutionState::Cancelled));
    assert_eq!(finish(&ctx, "halt").await, ExecutionState::Succeeded);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_rerouted_query_waits_behind_stop() {
    let ctx = context();
    ctx.add_sim_robot("quad-a", Some("quad"), &["camera"], SimBehavior::ack_after(1));
    ctx.add_sim_robot("quad-b", Some("quad"), &["camera"], SimBehavior::ack_after(1));
    ctx.sim().set_behavior("quad-b", EMERGENCY_STOP, SimBehavior::ack_after(30));

    ctx.submit(&stop("stop-b", json!("quad-b"))).await.unwrap();
    let query = request(
        "q-1",
        "sensor.read",
        json!({ "type": "quad", "capability": "camera" }),
        json!({ "sensor": "camera" }),
        2_000,
        "normal",
    );
    ctx.submit(&query).await.unwrap();
    assert_eq!(ctx.status("q-1").await.unwrap().assigned_robot_id.as_deref(), Some("quad-a"));

    // The only other camera quad is still being stopped
    ctx.router().mark_unhealthy("quad-a", "link dropped");
    ctx.start();

    assert_eq!(finish(&ctx, "stop-b").await, ExecutionState::Succeeded);
    assert_eq!(finish(&ctx, "q-1").await, ExecutionState::Succeeded);

    let query = ctx.executor().record("q-1").await.unwrap();
    assert_eq!(query.assigned_robot_id.as_deref(), Some("quad-b"));
    assert_eq!(query.attempts, 1);

    let deliveries = ctx.sim().deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].command_id, "stop-b");
    assert_eq!(deliveries[1].command_id, "q-1");
    assert!(deliveries[1].at.duration_since(deliveries[0].at) >= Duration::from_millis(25));
    ctx.shutdown().await;
}
