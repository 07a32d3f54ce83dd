//! Action executor
//!
//! Accepts validated commands, routes them, queues them by priority and
//! drives each one to a terminal state through a bounded worker pool.
//! Emergency commands bypass the queue and preempt the robots they target.

mod estop;
mod queue;
mod records;
mod sweeper;
mod worker;

use crate::config::McpConfig;
use crate::events::{EventKind, EventSink, LifecycleEvent};
use crate::plugins::PluginRegistry;
use crate::router::{RobotRouter, RoutingError};
use crate::transport::TransportRegistry;
use crate::validator::{ActionCatalog, ValidatedCommand};
use mcp_shared::state_machine::ExecutionEvent;
use mcp_shared::{Command, CommandError, CommandOutcome, CommandResult, ErrorKind, Priority, SubmitReceipt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use queue::{DispatchQueue, InFlightSlot, QueueEntry};
pub use records::{CommandRef, ExecutionRecord, RecordTable, TransitionError};
pub use sweeper::Sweeper;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("executor is shutting down")]
    ShuttingDown,
}

impl From<SubmitError> for CommandError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Routing(err) => err.into(),
            SubmitError::ShuttingDown => CommandError::new(ErrorKind::Internal, err.to_string()),
        }
    }
}

pub struct ActionExecutor {
    config: McpConfig,
    router: Arc<RobotRouter>,
    plugins: Arc<PluginRegistry>,
    catalog: Arc<ActionCatalog>,
    transports: Arc<TransportRegistry>,
    records: RecordTable,
    queue: Arc<DispatchQueue>,
    sink: Arc<dyn EventSink>,
    /// Per-robot mutual exclusion for dequeue, cancel and preemption
    sections: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ActionExecutor {
    pub fn new(
        config: McpConfig,
        router: Arc<RobotRouter>,
        plugins: Arc<PluginRegistry>,
        catalog: Arc<ActionCatalog>,
        transports: Arc<TransportRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            router,
            plugins,
            catalog,
            transports,
            records: RecordTable::new(sink.clone()),
            queue: Arc::new(DispatchQueue::new()),
            sink,
            sections: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker pool and the sweeper
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            warn!("[EXEC] start called twice, ignoring");
            return;
        }
        for worker_id in 0..self.config.workers {
            let executor = self.clone();
            tasks.push(tokio::spawn(async move { executor.worker_loop(worker_id).await }));
        }
        let sweeper = Sweeper::new(self.clone(), Duration::from_millis(self.config.sweep_interval_ms));
        tasks.push(tokio::spawn(async move { sweeper.run().await }));
        info!("[EXEC] Started {} workers", self.config.workers);
    }

    pub fn records(&self) -> &RecordTable {
        &self.records
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    fn section(&self, robot_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.sections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(robot_id.to_string())
            .or_default()
            .clone()
    }

    fn emit(&self, trace_id: &str, command_id: &str, kind: EventKind) {
        self.sink.emit(LifecycleEvent::new(trace_id, command_id, kind));
    }

    fn receipt(record: &ExecutionRecord, duplicate: bool) -> SubmitReceipt {
        SubmitReceipt {
            command_id: record.command_id.clone(),
            trace_id: record.trace_id.clone(),
            state: record.state,
            duplicate,
        }
    }

    fn duplicate(&self, existing: &ExecutionRecord) -> SubmitReceipt {
        info!(
            "[EXEC] Duplicate submission of {} ({}), not re-executing",
            existing.command_id, existing.state
        );
        self.emit(
            &existing.trace_id,
            &existing.command_id,
            EventKind::Duplicate {
                state: existing.state,
            },
        );
        Self::receipt(existing, true)
    }

    fn reject(&self, command: &Command, err: SubmitError) -> SubmitError {
        let wire: CommandError = err.clone().into();
        warn!("[EXEC] Rejected {}: {}", command.id, wire);
        self.emit(
            &command.trace_id,
            &command.id,
            EventKind::Rejected {
                kind: wire.kind,
                message: wire.message,
            },
        );
        err
    }

    /// Accept a validated command
    ///
    /// Routing errors come back synchronously; everything after acceptance
    /// is recorded on the execution record.
    pub async fn submit(self: &Arc<Self>, validated: ValidatedCommand) -> Result<SubmitReceipt, SubmitError> {
        self.admit(validated.command, validated.composite).await
    }

    pub(crate) async fn admit(self: &Arc<Self>, command: Command, composite: bool) -> Result<SubmitReceipt, SubmitError> {
        if self.queue.is_closed() {
            return Err(self.reject(&command, SubmitError::ShuttingDown));
        }
        if let Some(existing) = self.records.get(&command.id).await {
            return Ok(self.duplicate(&existing));
        }

        if command.is_emergency_stop() {
            return self.admit_stop(command).await;
        }

        let binding = match self.router.resolve(&command.target, command.priority) {
            Ok(binding) => binding,
            Err(err) => return Err(self.reject(&command, err.into())),
        };
        let robot_id = binding.robot_id.clone();
        let priority = command.priority;
        let command_id = command.id.clone();
        let trace_id = command.trace_id.clone();

        let record = match self
            .records
            .insert_new(command, composite, None, Some(robot_id.clone()))
            .await
        {
            Ok(record) => record,
            Err(existing) => return Ok(self.duplicate(&existing)),
        };
        self.emit(
            &trace_id,
            &command_id,
            EventKind::Accepted {
                robot_id: Some(robot_id.clone()),
                priority,
            },
        );

        if priority == Priority::Emergency {
            self.preempt(&robot_id, &command_id).await;
            let executor = self.clone();
            tokio::spawn(async move { executor.run_emergency(command_id, binding).await });
        } else if !self.queue.push(&robot_id, priority, &command_id) {
            self.cancel_record(&command_id, "executor is shutting down").await;
        } else {
            info!("[EXEC] Queued {} for {} ({:?})", command_id, robot_id, priority);
        }

        Ok(Self::receipt(&record, false))
    }

    /// Cancel a command; returns its outcome after the attempt
    pub async fn cancel(&self, command_id: &str, reason: &str) -> Option<CommandOutcome> {
        let record = self.records.get(command_id).await?;
        let stop = self
            .records
            .command(command_id)
            .await
            .map(|c| c.command.is_emergency_stop())
            .unwrap_or(false);

        if !record.state.is_terminal() && !stop {
            match record.assigned_robot_id.as_deref() {
                Some(robot_id) => {
                    let section = self.section(robot_id);
                    let _guard = section.lock().await;
                    self.cancel_record(command_id, reason).await;
                }
                None => {
                    self.cancel_record(command_id, reason).await;
                }
            }
        }
        self.status(command_id).await
    }

    /// Cancel a record and its outstanding steps; caller holds the robot section
    async fn cancel_record(&self, command_id: &str, reason: &str) -> bool {
        let reason = reason.to_string();
        let cancelled = self
            .records
            .transition(command_id, ExecutionEvent::Cancelled, |r| {
                r.result = Some(CommandResult::Cancelled {
                    reason: reason.clone(),
                })
            })
            .await
            .is_ok();
        if cancelled {
            self.queue.remove(command_id);
            for child in self.records.children(command_id).await {
                let _ = self
                    .records
                    .transition(&child, ExecutionEvent::Cancelled, |r| {
                        r.result = Some(CommandResult::Cancelled {
                            reason: format!("parent {} cancelled", command_id),
                        })
                    })
                    .await;
            }
            info!("[EXEC] Cancelled {}: {}", command_id, reason);
        }
        cancelled
    }

    pub async fn status(&self, command_id: &str) -> Option<CommandOutcome> {
        self.records.get(command_id).await.map(|r| r.outcome())
    }

    pub async fn record(&self, command_id: &str) -> Option<ExecutionRecord> {
        self.records.get(command_id).await
    }

    /// Wait for a terminal state, up to `bound`
    pub async fn wait(&self, command_id: &str, bound: Duration) -> Option<CommandOutcome> {
        self.records.wait(command_id, bound).await.map(|r| r.outcome())
    }

    /// Stop the workers and cancel everything not yet terminal
    pub async fn shutdown(&self) {
        let drained = self.queue.close();
        info!("[EXEC] Shutting down, {} queued entries dropped", drained.len());
        for id in self.records.live_ids().await {
            self.cancel_record(&id, "executor shutting down").await;
        }

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}
