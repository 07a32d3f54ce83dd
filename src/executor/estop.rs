//! Emergency stop
//!
//! A stop goes to every binding matching its target, healthy or not. Before
//! it is delivered, each robot's lane is closed behind a barrier and every
//! other live record on that robot is cancelled. The stop only succeeds once
//! every robot has acknowledged within the short ack bound; anything less is
//! ESTOP_FAILED and is never retried.

use super::{ActionExecutor, SubmitError};
use crate::events::EventKind;
use crate::router::{RobotBinding, RoutingError};
use crate::transport::{DeliveryEvent, DeliveryHandle};
use futures::future::join_all;
use mcp_shared::state_machine::ExecutionEvent;
use mcp_shared::{
    Command, CommandError, CommandResult, ErrorKind, Params, Priority, PrimitiveCommand, SubmitReceipt, Target,
    EMERGENCY_STOP,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

impl ActionExecutor {
    pub(super) async fn admit_stop(self: &Arc<Self>, command: Command) -> Result<SubmitReceipt, SubmitError> {
        let bindings = self.router.resolve_all(&command.target);
        if bindings.is_empty() {
            let err = RoutingError::RobotOffline(command.target.to_string());
            return Err(self.reject(&command, err.into()));
        }
        let robots: Vec<String> = bindings.iter().map(|b| b.robot_id.clone()).collect();
        let assigned = match robots.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        };
        let command_id = command.id.clone();
        let trace_id = command.trace_id.clone();

        let record = match self.records.insert_new(command, false, None, assigned).await {
            Ok(record) => record,
            Err(existing) => return Ok(self.duplicate(&existing)),
        };

        warn!("[ESTOP] {} issued for {:?} (trace {})", command_id, robots, trace_id);
        self.emit(
            &trace_id,
            &command_id,
            EventKind::EmergencyStop {
                robots: robots.clone(),
            },
        );
        for robot_id in &robots {
            self.preempt(robot_id, &command_id).await;
        }

        let executor = self.clone();
        tokio::spawn(async move { executor.run_estop(command_id, bindings).await });
        Ok(Self::receipt(&record, false))
    }

    /// Close a robot's lane and cancel everything else live on it
    pub(super) async fn preempt(&self, robot_id: &str, by: &str) {
        let section = self.section(robot_id);
        let _guard = section.lock().await;

        self.queue.raise_barrier(robot_id);
        let reason = format!("preempted by emergency command {}", by);
        for id in self.records.live_for_robot(robot_id).await {
            if id == by {
                continue;
            }
            if self.cancel_record(&id, &reason).await {
                if let Some(record) = self.records.get(&id).await {
                    self.emit(&record.trace_id, &id, EventKind::Preempted { by: by.to_string() });
                }
            }
        }
    }

    async fn deliver_stop(
        &self,
        binding: &RobotBinding,
        primitive: &PrimitiveCommand,
    ) -> Result<DeliveryHandle, String> {
        let adapter = self
            .transports
            .get(binding.transport)
            .ok_or_else(|| format!("no adapter for transport {}", binding.transport))?;
        adapter
            .deliver(binding, primitive)
            .await
            .map_err(|err| err.to_string())
    }

    pub(super) async fn run_estop(self: Arc<Self>, command_id: String, bindings: Vec<RobotBinding>) {
        if let Some(cmd) = self.records.command(&command_id).await {
            if self
                .records
                .transition(&command_id, ExecutionEvent::Dequeued, |_| {})
                .await
                .is_ok()
            {
                self.stop_all(&command_id, &cmd.command, &bindings).await;
            }
        }
        for binding in &bindings {
            self.queue.lower_barrier(&binding.robot_id);
        }
    }

    async fn stop_all(&self, command_id: &str, command: &Command, bindings: &[RobotBinding]) {
        let bound = self.config.estop_ack_timeout();
        let primitive = PrimitiveCommand {
            timeout_ms: bound.as_millis() as u64,
            ..PrimitiveCommand::from(command)
        };

        let deliveries = join_all(bindings.iter().map(|b| self.deliver_stop(b, &primitive))).await;
        // Callers cannot cancel a stop; only shutdown can, and then the acks no longer matter
        let _ = self
            .records
            .transition(command_id, ExecutionEvent::DeliveryAccepted, |_| {})
            .await;

        let acks = deliveries
            .into_iter()
            .zip(bindings.iter())
            .map(|(delivery, binding)| async move {
                let robot_id = binding.robot_id.clone();
                let mut handle = match delivery {
                    Ok(handle) => handle,
                    Err(reason) => return Err(format!("{}: {}", robot_id, reason)),
                };
                let answer = tokio::time::timeout(bound, handle.outcome()).await;
                match answer {
                    Ok(DeliveryEvent::Ack { .. }) => Ok(robot_id),
                    Ok(DeliveryEvent::Fault { kind, message }) => {
                        Err(format!("{}: {} ({})", robot_id, kind, message))
                    }
                    Ok(DeliveryEvent::Disconnected { reason }) => {
                        Err(format!("{}: disconnected ({})", robot_id, reason))
                    }
                    Err(_) => {
                        handle.abort();
                        Err(format!(
                            "{}: no acknowledgement within {}ms",
                            robot_id,
                            bound.as_millis()
                        ))
                    }
                }
            });
        let results = join_all(acks).await;

        let (stopped, failed): (Vec<_>, Vec<_>) = results.into_iter().partition(Result::is_ok);
        let stopped: Vec<String> = stopped.into_iter().filter_map(Result::ok).collect();
        let failed: Vec<String> = failed.into_iter().filter_map(Result::err).collect();

        if failed.is_empty() {
            info!("[ESTOP] {} acknowledged by {:?}", command_id, stopped);
            let _ = self
                .records
                .transition(command_id, ExecutionEvent::Acknowledged, |r| {
                    r.result = Some(CommandResult::Completed {
                        payload: json!({ "stopped": stopped }),
                    })
                })
                .await;
        } else {
            error!(
                "[ESTOP] {} NOT CONFIRMED, manual intervention required: {}",
                command_id,
                failed.join("; ")
            );
            let err = CommandError::new(
                ErrorKind::EstopFailed,
                format!("stop not acknowledged: {}", failed.join("; ")),
            );
            let _ = self
                .records
                .transition(command_id, ExecutionEvent::Faulted, |r| {
                    r.last_error = Some(err.clone());
                    r.result = Some(CommandResult::Failed { error: err });
                })
                .await;
        }
    }

    /// Stop a robot that reported a safety violation, keeping the trace
    pub(super) fn escalate(self: &Arc<Self>, cause_id: &str, robot_id: &str, trace_id: &str) {
        let mut params = Params::new();
        params.insert(
            "reason".into(),
            Value::from(format!("safety violation on {}", cause_id)),
        );
        let stop = Command {
            id: format!("{}.estop", cause_id),
            command_type: EMERGENCY_STOP.into(),
            target: Target::robot(robot_id),
            params,
            timeout_ms: self.config.min_timeout_ms,
            priority: Priority::Emergency,
            trace_id: trace_id.to_string(),
        };
        error!(
            "[ESTOP] Safety violation on {} (trace {}), stopping {}",
            cause_id, trace_id, robot_id
        );

        let executor = self.clone();
        tokio::spawn(async move {
            let stop_id = stop.id.clone();
            if let Err(err) = executor.admit(stop, false).await {
                error!("[ESTOP] Escalation {} rejected: {}", stop_id, err);
            }
        });
    }
}
