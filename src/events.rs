//! Lifecycle events for the audit sink
//!
//! Every event carries the caller's `trace_id` unchanged and a
//! `correlation_id` naming the record (or step) it concerns.

use mcp_shared::{now_ms, ErrorKind, ExecutionState, Priority};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    ValidationPassed,
    ValidationFailed { field: String, reason: String },
    Rejected { kind: ErrorKind, message: String },
    Duplicate { state: ExecutionState },
    Accepted { robot_id: Option<String>, priority: Priority },
    StateChanged {
        from: ExecutionState,
        to: ExecutionState,
        attempts: u32,
    },
    RetryScheduled { attempt: u32, backoff_ms: u64 },
    Expanded { steps: usize },
    EmergencyStop { robots: Vec<String> },
    Preempted { by: String },
    BindingRegistered { robot_id: String },
    BindingUnhealthy { robot_id: String, reason: String },
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub trace_id: String,
    pub correlation_id: String,
    pub at_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl LifecycleEvent {
    pub fn new(trace_id: impl Into<String>, correlation_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            trace_id: trace_id.into(),
            correlation_id: correlation_id.into(),
            at_ms: now_ms(),
            kind,
        }
    }
}

/// Receiver of lifecycle events (the external audit collaborator)
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Logs events through `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: LifecycleEvent) {
        match &event.kind {
            EventKind::ValidationFailed { .. }
            | EventKind::Rejected { .. }
            | EventKind::BindingUnhealthy { .. }
            | EventKind::EmergencyStop { .. } => warn!(
                trace_id = %event.trace_id,
                correlation_id = %event.correlation_id,
                "[AUDIT] {:?}",
                event.kind
            ),
            _ => info!(
                trace_id = %event.trace_id,
                correlation_id = %event.correlation_id,
                "[AUDIT] {:?}",
                event.kind
            ),
        }
    }
}

/// Forwards events into a channel for an external consumer
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: LifecycleEvent) {
        // A departed consumer must not stall the pipeline
        let _ = self.tx.send(event);
    }
}

/// Sends each event to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: LifecycleEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
