//! Worker loop: one execution record at a time from dispatch to terminal

use super::queue::{InFlightSlot, QueueEntry};
use super::records::{until_terminal, CommandRef, ExecutionRecord};
use super::ActionExecutor;
use crate::events::EventKind;
use crate::plugins::PrimitiveStep;
use crate::router::{RobotBinding, RoutingError};
use crate::transport::DeliveryEvent;
use crate::validator::check_params;
use mcp_shared::state_machine::ExecutionEvent;
use mcp_shared::{
    Command, CommandError, CommandResult, ErrorKind, ExecutionState, PrimitiveCommand, Target,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How one delivery attempt ended
#[derive(Debug)]
pub(super) enum AttemptOutcome {
    Succeeded(Value),
    Failed(CommandError),
    TimedOut,
    Cancelled,
}

pub(super) enum Settled {
    Done,
    Retry(Duration),
}

enum Rebound {
    Ready(RobotBinding, Arc<InFlightSlot>),
    Parked,
}

enum Race {
    Event(DeliveryEvent),
    Deadline,
    Cancelled,
}

fn remaining_ms(deadline: Instant) -> u64 {
    deadline.saturating_duration_since(Instant::now()).as_millis() as u64
}

/// The primitive sent to the robot carries only the budget left
fn primitive(command: &Command, deadline: Instant) -> PrimitiveCommand {
    PrimitiveCommand {
        timeout_ms: remaining_ms(deadline),
        ..PrimitiveCommand::from(command)
    }
}

impl ActionExecutor {
    pub(super) async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("[EXEC] Worker {} started", worker_id);
        while let Some((entry, slot)) = self.queue.next(&self.router).await {
            self.dispatch(entry, slot).await;
        }
        debug!("[EXEC] Worker {} stopped", worker_id);
    }

    async fn dispatch(self: &Arc<Self>, entry: QueueEntry, slot: Arc<InFlightSlot>) {
        let id = entry.command_id.as_str();
        let Some(cmd) = self.records.command(id).await else {
            return;
        };

        if Instant::now() >= cmd.deadline {
            self.expire(id, &cmd.command).await;
            return;
        }

        {
            let section = self.section(&entry.robot_id);
            let _guard = section.lock().await;
            if self
                .records
                .transition(id, ExecutionEvent::Dequeued, |_| {})
                .await
                .is_err()
            {
                // Cancelled while it waited in the queue
                return;
            }
            self.records.attach_slot(id, slot.clone()).await;
        }

        let (binding, slot) = match self.rebind(id, &cmd, slot).await {
            Ok(Rebound::Ready(binding, slot)) => (binding, slot),
            Ok(Rebound::Parked) => return,
            Err(err) => {
                self.fail(id, err.into()).await;
                return;
            }
        };

        if cmd.composite {
            self.run_composite(id, &cmd, &binding).await;
        } else {
            let primitive = primitive(&cmd.command, cmd.deadline);
            let outcome = self.attempt(id, &binding, &primitive, cmd.deadline).await;
            if let Settled::Retry(backoff) = self.settle(id, &binding, outcome, cmd.deadline).await {
                let queue = self.queue.clone();
                let robot_id = binding.robot_id.clone();
                let priority = cmd.command.priority;
                let command_id = id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    queue.push(&robot_id, priority, &command_id);
                });
            }
        }
        drop(slot);
    }

    /// Confirm the assigned robot is still usable, re-routing queries if not
    ///
    /// A replacement robot behind an emergency barrier does not take the
    /// command yet: it is parked on that robot's lane and dispatches once
    /// the barrier drops.
    async fn rebind(
        &self,
        id: &str,
        cmd: &CommandRef,
        slot: Arc<InFlightSlot>,
    ) -> Result<Rebound, RoutingError> {
        if let Some(binding) = self
            .router
            .binding(slot.robot_id())
            .filter(RobotBinding::is_healthy)
        {
            return Ok(Rebound::Ready(binding, slot));
        }

        let lost = slot.robot_id().to_string();
        if !matches!(cmd.command.target, Target::Query { .. }) {
            return Err(RoutingError::RobotOffline(lost));
        }

        let binding = self.router.resolve(&cmd.command.target, cmd.command.priority)?;
        let robot_id = binding.robot_id.clone();

        // Same section the emergency path raises barriers under
        let section = self.section(&robot_id);
        let _guard = section.lock().await;

        if self.queue.is_blocked(&robot_id) {
            let parked = self
                .records
                .transition(id, ExecutionEvent::Requeued, |r| {
                    // Nothing reached a robot on this pass
                    r.attempts = r.attempts.saturating_sub(1);
                    r.assigned_robot_id = Some(robot_id.clone());
                })
                .await;
            if parked.is_ok() {
                self.queue.push(&robot_id, cmd.command.priority, id);
                info!("[EXEC] {} re-routed from {} to {}, waiting behind stop", id, lost, robot_id);
            }
            return Ok(Rebound::Parked);
        }

        let replacement = self
            .queue
            .slot(&self.router, &robot_id)
            .ok_or_else(|| RoutingError::RobotBusy(robot_id.clone()))?;
        slot.release();
        self.records.attach_slot(id, replacement.clone()).await;
        info!("[EXEC] {} re-routed from {} to {}", id, lost, robot_id);
        Ok(Rebound::Ready(binding, replacement))
    }

    /// Deliver once and race the robot's answer against the deadline
    async fn attempt(
        &self,
        id: &str,
        binding: &RobotBinding,
        primitive: &PrimitiveCommand,
        deadline: Instant,
    ) -> AttemptOutcome {
        let Some(mut state_rx) = self.records.subscribe(id).await else {
            return AttemptOutcome::Cancelled;
        };
        let Some(adapter) = self.transports.get(binding.transport) else {
            return AttemptOutcome::Failed(CommandError::new(
                ErrorKind::Internal,
                format!("no adapter registered for transport {}", binding.transport),
            ));
        };

        let mut handle = match adapter.deliver(binding, primitive).await {
            Ok(handle) => handle,
            Err(err) if err.is_connection_lost() => {
                self.router.mark_unhealthy(&binding.robot_id, &err.to_string());
                return AttemptOutcome::Failed(CommandError::new(
                    ErrorKind::HardwareFault,
                    format!("connection lost: {}", err),
                ));
            }
            Err(err) => {
                return AttemptOutcome::Failed(CommandError::new(ErrorKind::Internal, err.to_string()));
            }
        };

        if self
            .records
            .transition(id, ExecutionEvent::DeliveryAccepted, |_| {})
            .await
            .is_err()
        {
            handle.abort();
            return AttemptOutcome::Cancelled;
        }
        debug!(
            "[EXEC] {} delivered to {} as #{}",
            id, binding.robot_id, handle.delivery_id
        );

        let remaining = deadline.saturating_duration_since(Instant::now());
        let race = tokio::select! {
            event = handle.outcome() => Race::Event(event),
            _ = tokio::time::sleep(remaining) => Race::Deadline,
            _ = until_terminal(&mut state_rx) => Race::Cancelled,
        };

        match race {
            Race::Event(DeliveryEvent::Ack { payload }) => AttemptOutcome::Succeeded(payload),
            Race::Event(DeliveryEvent::Fault { kind, message }) => {
                AttemptOutcome::Failed(CommandError::new(kind, message))
            }
            Race::Event(DeliveryEvent::Disconnected { reason }) => {
                self.router.mark_unhealthy(&binding.robot_id, &reason);
                AttemptOutcome::Failed(CommandError::new(
                    ErrorKind::HardwareFault,
                    format!("connection lost: {}", reason),
                ))
            }
            Race::Deadline => {
                handle.abort();
                AttemptOutcome::TimedOut
            }
            Race::Cancelled => {
                handle.abort();
                AttemptOutcome::Cancelled
            }
        }
    }

    /// Record the attempt's result; decides whether a retry follows
    async fn settle(
        self: &Arc<Self>,
        id: &str,
        binding: &RobotBinding,
        outcome: AttemptOutcome,
        deadline: Instant,
    ) -> Settled {
        match outcome {
            AttemptOutcome::Succeeded(payload) => {
                let _ = self
                    .records
                    .transition(id, ExecutionEvent::Acknowledged, |r| {
                        r.result = Some(CommandResult::Completed { payload })
                    })
                    .await;
                Settled::Done
            }
            AttemptOutcome::TimedOut => {
                if let Some(cmd) = self.records.command(id).await {
                    self.expire(id, &cmd.command).await;
                }
                Settled::Done
            }
            AttemptOutcome::Cancelled => Settled::Done,
            AttemptOutcome::Failed(err) => {
                let Some(record) = self.records.get(id).await else {
                    return Settled::Done;
                };
                let backoff = self.config.backoff_for(record.attempts);
                let retriable = err.kind.is_retriable()
                    && record.attempts < self.config.max_attempts
                    && Instant::now() + backoff < deadline;

                if retriable {
                    let last = err.clone();
                    if self
                        .records
                        .transition(id, ExecutionEvent::Requeued, |r| r.last_error = Some(last))
                        .await
                        .is_ok()
                    {
                        warn!(
                            "[EXEC] {} attempt {}/{} failed ({}), retrying in {:?}",
                            id, record.attempts, self.config.max_attempts, err, backoff
                        );
                        self.emit(
                            &record.trace_id,
                            id,
                            EventKind::RetryScheduled {
                                attempt: record.attempts + 1,
                                backoff_ms: backoff.as_millis() as u64,
                            },
                        );
                        return Settled::Retry(backoff);
                    }
                    return Settled::Done;
                }

                let kind = err.kind;
                if self.fail(id, err).await
                    && kind == ErrorKind::SafetyViolation
                    && self.config.estop_on_safety_violation
                {
                    self.escalate(id, &binding.robot_id, &record.trace_id);
                }
                Settled::Done
            }
        }
    }

    /// Run one record to a terminal state inline, retries included
    async fn run_inline(self: &Arc<Self>, id: &str, binding: &RobotBinding) -> Option<ExecutionRecord> {
        let cmd = self.records.command(id).await?;
        loop {
            if Instant::now() >= cmd.deadline {
                self.expire(id, &cmd.command).await;
                break;
            }
            if self
                .records
                .transition(id, ExecutionEvent::Dequeued, |_| {})
                .await
                .is_err()
            {
                break;
            }
            let primitive = primitive(&cmd.command, cmd.deadline);
            let outcome = self.attempt(id, binding, &primitive, cmd.deadline).await;
            match self.settle(id, binding, outcome, cmd.deadline).await {
                Settled::Retry(backoff) => tokio::time::sleep(backoff).await,
                Settled::Done => break,
            }
        }
        self.records.get(id).await
    }

    /// Emergency commands skip the queue and run on the spawning task
    pub(super) async fn run_emergency(self: Arc<Self>, command_id: String, binding: RobotBinding) {
        if let Some(cmd) = self.records.command(&command_id).await {
            if cmd.composite {
                if self
                    .records
                    .transition(&command_id, ExecutionEvent::Dequeued, |_| {})
                    .await
                    .is_ok()
                {
                    self.run_composite(&command_id, &cmd, &binding).await;
                }
            } else {
                self.run_inline(&command_id, &binding).await;
            }
        }
        self.queue.lower_barrier(&binding.robot_id);
    }

    /// Expand a composite and validate every step against the catalog
    fn expand_steps(&self, command: &Command) -> Result<Vec<PrimitiveStep>, CommandError> {
        let steps = self.plugins.expand(&command.command_type, &command.params)?;
        for (n, step) in steps.iter().enumerate() {
            let spec = self.catalog.get(&step.action).ok_or_else(|| {
                CommandError::new(
                    ErrorKind::ActionInvalid,
                    format!("step {} uses unknown action '{}'", n + 1, step.action),
                )
                .with_step(&step.action)
            })?;
            check_params(&spec.params, &step.params).map_err(|violation| {
                CommandError::new(
                    ErrorKind::ParamInvalid,
                    format!("step {} ({}): {}", n + 1, step.action, violation.reason),
                )
                .with_step(&step.action)
                .with_field(format!("params.{}", violation.key))
            })?;
        }
        Ok(steps)
    }

    /// Run the steps of a dispatched composite in order, failing fast
    async fn run_composite(self: &Arc<Self>, id: &str, cmd: &CommandRef, binding: &RobotBinding) {
        let parent = &cmd.command;
        let steps = match self.expand_steps(parent) {
            Ok(steps) => steps,
            Err(err) => {
                self.fail(id, err).await;
                return;
            }
        };
        self.emit(&parent.trace_id, id, EventKind::Expanded { steps: steps.len() });

        let mut children: Vec<(String, String)> = Vec::with_capacity(steps.len());
        for (n, step) in steps.into_iter().enumerate() {
            let child_id = format!("{}/{}", id, n + 1);
            let child = Command {
                id: child_id.clone(),
                command_type: step.action.clone(),
                target: Target::robot(binding.robot_id.clone()),
                params: step.params,
                timeout_ms: remaining_ms(cmd.deadline).max(1),
                priority: parent.priority,
                trace_id: parent.trace_id.clone(),
            };
            let inserted = self
                .records
                .insert_new(child, false, Some(id.to_string()), Some(binding.robot_id.clone()))
                .await;
            if inserted.is_err() {
                self.cancel_steps(&children, "composite aborted").await;
                self.fail(
                    id,
                    CommandError::new(ErrorKind::Internal, format!("step id {} already in use", child_id)),
                )
                .await;
                return;
            }
            self.records.add_child(id, &child_id).await;
            children.push((child_id, step.action));
        }

        if self
            .records
            .transition(id, ExecutionEvent::DeliveryAccepted, |_| {})
            .await
            .is_err()
        {
            self.cancel_steps(&children, "composite cancelled").await;
            return;
        }

        let mut payloads = Vec::with_capacity(children.len());
        for (n, (child_id, action)) in children.iter().enumerate() {
            let parent_live = self
                .records
                .state(id)
                .await
                .map(|s| !s.is_terminal())
                .unwrap_or(false);
            if !parent_live {
                self.cancel_steps(&children[n..], "composite cancelled").await;
                return;
            }

            let Some(step) = self.run_inline(child_id, binding).await else {
                return;
            };
            if step.state == ExecutionState::Succeeded {
                payloads.push(match step.result {
                    Some(CommandResult::Completed { payload }) => payload,
                    _ => Value::Null,
                });
                continue;
            }

            self.fail_parent(id, n + 1, action, &step).await;
            self.cancel_steps(
                &children[n + 1..],
                &format!("step {} ({}) did not succeed", n + 1, action),
            )
            .await;
            return;
        }

        let _ = self
            .records
            .transition(id, ExecutionEvent::Acknowledged, |r| {
                r.result = Some(CommandResult::Completed {
                    payload: json!({ "steps": payloads }),
                })
            })
            .await;
    }

    /// Report a failed step on the parent, naming the step
    async fn fail_parent(&self, id: &str, n: usize, action: &str, step: &ExecutionRecord) {
        match step.state {
            ExecutionState::TimedOut => {
                let err = CommandError::new(
                    ErrorKind::Timeout,
                    format!("step {} ({}) timed out", n, action),
                )
                .with_step(action);
                let _ = self
                    .records
                    .transition(id, ExecutionEvent::DeadlineExpired, |r| {
                        r.last_error = Some(err.clone());
                        r.result = Some(CommandResult::Failed { error: err });
                    })
                    .await;
            }
            ExecutionState::Cancelled => {
                let reason = format!("step {} ({}) was cancelled", n, action);
                let _ = self
                    .records
                    .transition(id, ExecutionEvent::Cancelled, |r| {
                        r.result = Some(CommandResult::Cancelled { reason })
                    })
                    .await;
            }
            _ => {
                let cause = step
                    .error()
                    .cloned()
                    .unwrap_or_else(|| CommandError::new(ErrorKind::Internal, "step failed without an error"));
                let err = CommandError::new(
                    cause.kind,
                    format!("step {} ({}) failed: {}", n, action, cause.message),
                )
                .with_step(action);
                warn!("[EXEC] {} failed at step {} ({})", id, n, action);
                self.fail(id, err).await;
            }
        }
    }

    async fn cancel_steps(&self, steps: &[(String, String)], reason: &str) {
        for (child_id, _) in steps {
            let reason = reason.to_string();
            let _ = self
                .records
                .transition(child_id, ExecutionEvent::Cancelled, |r| {
                    r.result = Some(CommandResult::Cancelled { reason })
                })
                .await;
        }
    }

    /// Terminal failure; INTERNAL details stay in the log
    pub(super) async fn fail(&self, id: &str, err: CommandError) -> bool {
        let surfaced = if err.kind == ErrorKind::Internal {
            error!("[EXEC] Internal error on {}: {}", id, err.message);
            CommandError::new(ErrorKind::Internal, "internal error")
        } else {
            err
        };
        self.records
            .transition(id, ExecutionEvent::Faulted, |r| {
                r.last_error = Some(surfaced.clone());
                r.result = Some(CommandResult::Failed { error: surfaced });
            })
            .await
            .is_ok()
    }

    /// The overall budget ran out
    pub(super) async fn expire(&self, id: &str, command: &Command) -> bool {
        let err = CommandError::new(
            ErrorKind::Timeout,
            format!("no terminal response within {}ms", command.timeout_ms),
        );
        self.records
            .transition(id, ExecutionEvent::DeadlineExpired, |r| {
                r.last_error = Some(err.clone());
                r.result = Some(CommandResult::Failed { error: err });
            })
            .await
            .is_ok()
    }
}
