//! Execution record table
//!
//! All state changes go through `transition`, which checks the move against
//! the execution state machine, stamps timestamps, publishes the new state to
//! watchers and returns the robot slot once the record leaves flight.

use super::queue::InFlightSlot;
use crate::events::{EventKind, EventSink, LifecycleEvent};
use mcp_shared::state_machine::{self, ExecutionEvent, TransitionResult};
use mcp_shared::{now_ms, Command, CommandError, CommandOutcome, CommandResult, ExecutionState, Priority};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("no execution record for {0}")]
    Unknown(String),

    #[error("{command_id}: {event:?} is not allowed from {from}")]
    Invalid {
        command_id: String,
        from: ExecutionState,
        event: ExecutionEvent,
    },
}

/// Per-command execution state, owned by the executor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub command_id: String,
    pub trace_id: String,
    /// Set on the steps of a composite command
    pub parent_id: Option<String>,
    pub state: ExecutionState,
    pub priority: Priority,
    pub attempts: u32,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub assigned_robot_id: Option<String>,
    pub last_error: Option<CommandError>,
    pub result: Option<CommandResult>,
}

impl ExecutionRecord {
    pub fn outcome(&self) -> CommandOutcome {
        CommandOutcome {
            command_id: self.command_id.clone(),
            trace_id: self.trace_id.clone(),
            state: self.state,
            attempts: self.attempts,
            assigned_robot_id: self.assigned_robot_id.clone(),
            result: self.result.clone(),
        }
    }

    /// The structured error of a failed or timed-out record
    pub fn error(&self) -> Option<&CommandError> {
        self.result.as_ref().and_then(CommandResult::error)
    }
}

/// Immutable parts of an accepted command
#[derive(Debug, Clone)]
pub struct CommandRef {
    pub command: Arc<Command>,
    pub composite: bool,
    /// Overall budget: acceptance plus `timeout_ms`
    pub deadline: Instant,
}

struct RecordEntry {
    record: ExecutionRecord,
    command: CommandRef,
    state_tx: watch::Sender<ExecutionState>,
    children: Vec<String>,
    slot: Option<Arc<InFlightSlot>>,
}

pub struct RecordTable {
    entries: RwLock<HashMap<String, RecordEntry>>,
    sink: Arc<dyn EventSink>,
}

impl RecordTable {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// Create a QUEUED record unless the id is already known
    ///
    /// The check and the insert happen under one write lock, so concurrent
    /// submissions of one id produce exactly one record.
    pub async fn insert_new(
        &self,
        command: Command,
        composite: bool,
        parent_id: Option<String>,
        assigned_robot_id: Option<String>,
    ) -> Result<ExecutionRecord, ExecutionRecord> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&command.id) {
            return Err(existing.record.clone());
        }

        let record = ExecutionRecord {
            command_id: command.id.clone(),
            trace_id: command.trace_id.clone(),
            parent_id,
            state: ExecutionState::Queued,
            priority: command.priority,
            attempts: 0,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            assigned_robot_id,
            last_error: None,
            result: None,
        };
        let (state_tx, _) = watch::channel(ExecutionState::Queued);
        let deadline = Instant::now() + Duration::from_millis(command.timeout_ms);
        entries.insert(
            command.id.clone(),
            RecordEntry {
                record: record.clone(),
                command: CommandRef {
                    command: Arc::new(command),
                    composite,
                    deadline,
                },
                state_tx,
                children: Vec::new(),
                slot: None,
            },
        );
        Ok(record)
    }

    pub async fn add_child(&self, parent_id: &str, child_id: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(parent_id) {
            entry.children.push(child_id.to_string());
        }
    }

    pub async fn get(&self, command_id: &str) -> Option<ExecutionRecord> {
        self.entries
            .read()
            .await
            .get(command_id)
            .map(|e| e.record.clone())
    }

    pub async fn state(&self, command_id: &str) -> Option<ExecutionState> {
        self.entries
            .read()
            .await
            .get(command_id)
            .map(|e| e.record.state)
    }

    pub async fn command(&self, command_id: &str) -> Option<CommandRef> {
        self.entries
            .read()
            .await
            .get(command_id)
            .map(|e| e.command.clone())
    }

    pub async fn children(&self, command_id: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .get(command_id)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    pub async fn subscribe(&self, command_id: &str) -> Option<watch::Receiver<ExecutionState>> {
        self.entries
            .read()
            .await
            .get(command_id)
            .map(|e| e.state_tx.subscribe())
    }

    /// Park the robot slot on the record so cancellation can return it early
    pub async fn attach_slot(&self, command_id: &str, slot: Arc<InFlightSlot>) {
        if let Some(entry) = self.entries.write().await.get_mut(command_id) {
            if entry.record.state.is_terminal() {
                slot.release();
            } else {
                entry.record.assigned_robot_id = Some(slot.robot_id().to_string());
                entry.slot = Some(slot);
            }
        }
    }

    /// Apply a lifecycle event, then `update` on success
    pub async fn transition<F>(
        &self,
        command_id: &str,
        event: ExecutionEvent,
        update: F,
    ) -> Result<ExecutionState, TransitionError>
    where
        F: FnOnce(&mut ExecutionRecord),
    {
        let (from, to, record) = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(command_id)
                .ok_or_else(|| TransitionError::Unknown(command_id.to_string()))?;

            let from = entry.record.state;
            let to = match state_machine::apply(from, event) {
                TransitionResult::Success(to) => to,
                TransitionResult::Invalid { from, event } => {
                    return Err(TransitionError::Invalid {
                        command_id: command_id.to_string(),
                        from,
                        event,
                    })
                }
            };

            let record = &mut entry.record;
            record.state = to;
            if event == ExecutionEvent::Dequeued {
                record.attempts += 1;
                record.started_at.get_or_insert_with(now_ms);
            }
            if to.is_terminal() {
                record.completed_at = Some(now_ms());
            }
            update(record);

            if to.is_terminal() || to == ExecutionState::Queued {
                if let Some(slot) = entry.slot.take() {
                    slot.release();
                }
            }
            entry.state_tx.send_replace(to);
            (from, to, entry.record.clone())
        };

        debug!(
            "[EXEC] {} {} -> {} (attempt {})",
            command_id, from, to, record.attempts
        );
        self.sink.emit(LifecycleEvent::new(
            record.trace_id.as_str(),
            command_id,
            EventKind::StateChanged {
                from,
                to,
                attempts: record.attempts,
            },
        ));
        Ok(to)
    }

    /// Wait until the record is terminal or `bound` elapses
    pub async fn wait(&self, command_id: &str, bound: Duration) -> Option<ExecutionRecord> {
        let mut rx = self.subscribe(command_id).await?;
        let _ = tokio::time::timeout(bound, until_terminal(&mut rx)).await;
        self.get(command_id).await
    }

    /// Live records assigned to a robot, emergency records excluded
    pub async fn live_for_robot(&self, robot_id: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.record.state.is_terminal())
            .filter(|e| e.record.priority != Priority::Emergency)
            .filter(|e| e.record.assigned_robot_id.as_deref() == Some(robot_id))
            .map(|e| e.record.command_id.clone())
            .collect()
    }

    pub async fn live_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.record.state.is_terminal())
            .map(|e| e.record.command_id.clone())
            .collect()
    }

    /// QUEUED records whose overall budget is already spent
    pub async fn queued_past_deadline(&self, now: Instant) -> Vec<String> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.record.state == ExecutionState::Queued && e.command.deadline <= now)
            .map(|e| e.record.command_id.clone())
            .collect()
    }

    /// Forget terminal records older than the retention window
    pub async fn evict_terminal_older_than(&self, retention: Duration) -> Vec<String> {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .values()
            .filter(|e| e.record.completed_at.map(|t| t <= cutoff).unwrap_or(false))
            .map(|e| e.record.command_id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Resolve once the watched record reaches a terminal state
pub(crate) async fn until_terminal(rx: &mut watch::Receiver<ExecutionState>) {
    loop {
        if rx.borrow_and_update().is_terminal() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use mcp_shared::{Params, Target};

    fn command(id: &str) -> Command {
        Command {
            id: id.into(),
            command_type: "system.status".into(),
            target: Target::robot("r1"),
            params: Params::new(),
            timeout_ms: 1000,
            priority: Priority::Normal,
            trace_id: "trace-9".into(),
        }
    }

    fn table() -> (RecordTable, tokio::sync::mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (sink, rx) = ChannelSink::new();
        (RecordTable::new(Arc::new(sink)), rx)
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let (table, _rx) = table();
        assert!(table.insert_new(command("c-1"), false, None, None).await.is_ok());
        let existing = table.insert_new(command("c-1"), false, None, None).await.unwrap_err();
        assert_eq!(existing.state, ExecutionState::Queued);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_transition_counts_attempts_and_emits() {
        let (table, mut rx) = table();
        table.insert_new(command("c-1"), false, None, None).await.unwrap();

        table.transition("c-1", ExecutionEvent::Dequeued, |_| {}).await.unwrap();
        table.transition("c-1", ExecutionEvent::Requeued, |_| {}).await.unwrap();
        table.transition("c-1", ExecutionEvent::Dequeued, |_| {}).await.unwrap();
        table.transition("c-1", ExecutionEvent::DeliveryAccepted, |_| {}).await.unwrap();
        table
            .transition("c-1", ExecutionEvent::Acknowledged, |r| {
                r.result = Some(CommandResult::Completed { payload: serde_json::json!({}) })
            })
            .await
            .unwrap();

        let record = table.get("c-1").await.unwrap();
        assert_eq!(record.state, ExecutionState::Succeeded);
        assert_eq!(record.attempts, 2);
        assert!(record.completed_at.is_some());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.trace_id, "trace-9");
        assert!(matches!(event.kind, EventKind::StateChanged { .. }));
    }

    #[tokio::test]
    async fn test_terminal_rejects_further_events() {
        let (table, _rx) = table();
        table.insert_new(command("c-1"), false, None, None).await.unwrap();
        table.transition("c-1", ExecutionEvent::Cancelled, |_| {}).await.unwrap();
        let err = table
            .transition("c-1", ExecutionEvent::Dequeued, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { from: ExecutionState::Cancelled, .. }));
        assert!(matches!(
            table.transition("nope", ExecutionEvent::Dequeued, |_| {}).await,
            Err(TransitionError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_terminal() {
        let (table, _rx) = table();
        let table = Arc::new(table);
        table.insert_new(command("c-1"), false, None, None).await.unwrap();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait("c-1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        table.transition("c-1", ExecutionEvent::DeadlineExpired, |_| {}).await.unwrap();
        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.state, ExecutionState::TimedOut);
    }

    #[tokio::test]
    async fn test_eviction_only_touches_terminal() {
        let (table, _rx) = table();
        table.insert_new(command("done"), false, None, None).await.unwrap();
        table.insert_new(command("live"), false, None, None).await.unwrap();
        table.transition("done", ExecutionEvent::Cancelled, |_| {}).await.unwrap();

        let evicted = table.evict_terminal_older_than(Duration::ZERO).await;
        assert_eq!(evicted, vec!["done".to_string()]);
        assert!(table.get("live").await.is_some());
        // The id is free again once evicted
        assert!(table.insert_new(command("done"), false, None, None).await.is_ok());
    }
}
