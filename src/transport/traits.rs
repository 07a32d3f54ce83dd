//! Transport adapter abstraction for pluggable robot backends

use crate::router::RobotBinding;
use async_trait::async_trait;
use mcp_shared::codec::CodecError;
use mcp_shared::{ErrorKind, PrimitiveCommand, TransportKind};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("robot {0} is not connected")]
    NotConnected(String),

    #[error("send to {robot_id} failed: {reason}")]
    Send { robot_id: String, reason: String },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl TransportError {
    /// The link is gone, so the binding should stop receiving work
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::NotConnected(_) | TransportError::Send { .. })
    }
}

/// How a single delivery ended, as reported by the robot side
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    Ack { payload: Value },
    Fault { kind: ErrorKind, message: String },
    Disconnected { reason: String },
}

/// Adapter-side half of a delivery
#[derive(Debug)]
pub struct DeliveryResponder {
    events: oneshot::Sender<DeliveryEvent>,
    abort: oneshot::Receiver<()>,
}

impl DeliveryResponder {
    /// Complete the delivery; later calls are impossible by construction
    pub fn complete(self, event: DeliveryEvent) {
        let _ = self.events.send(event);
    }

    /// Split into the completion sender and the abort signal
    pub fn into_parts(self) -> (oneshot::Sender<DeliveryEvent>, oneshot::Receiver<()>) {
        (self.events, self.abort)
    }
}

/// Executor-side half of a delivery
#[derive(Debug)]
pub struct DeliveryHandle {
    pub delivery_id: u64,
    events: oneshot::Receiver<DeliveryEvent>,
    abort: Option<oneshot::Sender<()>>,
}

impl DeliveryHandle {
    pub fn new(delivery_id: u64) -> (Self, DeliveryResponder) {
        let (events_tx, events_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = oneshot::channel();
        (
            Self {
                delivery_id,
                events: events_rx,
                abort: Some(abort_tx),
            },
            DeliveryResponder {
                events: events_tx,
                abort: abort_rx,
            },
        )
    }

    /// Wait for the robot's answer; a dropped responder reads as a lost link
    pub async fn outcome(&mut self) -> DeliveryEvent {
        match (&mut self.events).await {
            Ok(event) => event,
            Err(_) => DeliveryEvent::Disconnected {
                reason: "delivery dropped by transport".into(),
            },
        }
    }

    /// Ask the adapter to abandon the delivery (best effort)
    pub fn abort(&mut self) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(());
        }
    }
}

/// Carries primitive commands to robots over one transport family
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Hand a primitive to the robot; completion arrives on the handle
    async fn deliver(
        &self,
        binding: &RobotBinding,
        command: &PrimitiveCommand,
    ) -> Result<DeliveryHandle, TransportError>;
}
