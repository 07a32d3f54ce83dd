//! Protocol types exchanged between callers, the mediation layer and robots

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Reserved command type for the emergency stop
pub const EMERGENCY_STOP: &str = "system.emergency_stop";

/// Named command arguments
pub type Params = serde_json::Map<String, Value>;

/// Command priority band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Emergency,
}

impl Priority {
    /// Parse a priority name, ignoring case
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "LOW" => Some(Priority::Low),
            "NORMAL" => Some(Priority::Normal),
            "HIGH" => Some(Priority::High),
            "EMERGENCY" => Some(Priority::Emergency),
            _ => None,
        }
    }
}

/// Robot selector carried by a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// Exact robot id
    Robot { robot_id: String },
    /// Any robot of the given type having every listed capability
    Query {
        robot_type: Option<String>,
        capabilities: Vec<String>,
    },
    /// Every registered robot (emergency stop only)
    All,
}

impl Target {
    pub fn robot(robot_id: impl Into<String>) -> Self {
        Target::Robot {
            robot_id: robot_id.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Robot { robot_id } => write!(f, "robot:{}", robot_id),
            Target::Query {
                robot_type,
                capabilities,
            } => write!(
                f,
                "query:type={} caps=[{}]",
                robot_type.as_deref().unwrap_or("*"),
                capabilities.join(",")
            ),
            Target::All => write!(f, "all"),
        }
    }
}

/// Immutable request envelope for one robot command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub target: Target,
    #[serde(default)]
    pub params: Params,
    pub timeout_ms: u64,
    #[serde(default)]
    pub priority: Priority,
    pub trace_id: String,
}

impl Command {
    /// Check if this is the reserved emergency stop
    pub fn is_emergency_stop(&self) -> bool {
        self.command_type == EMERGENCY_STOP
    }
}

/// Who issued a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: String,
    pub id: String,
}

/// A single action as delivered to a robot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveCommand {
    pub command_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Params,
    pub trace_id: String,
    pub timeout_ms: u64,
}

impl From<&Command> for PrimitiveCommand {
    fn from(command: &Command) -> Self {
        Self {
            command_id: command.id.clone(),
            action: command.command_type.clone(),
            params: command.params.clone(),
            trace_id: command.trace_id.clone(),
            timeout_ms: command.timeout_ms,
        }
    }
}

/// Execution state of an accepted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Queued,
    Dispatching,
    InProgress,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionState {
    /// Terminal states admit no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::Cancelled
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Queued => "QUEUED",
            ExecutionState::Dispatching => "DISPATCHING",
            ExecutionState::InProgress => "IN_PROGRESS",
            ExecutionState::Succeeded => "SUCCEEDED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::TimedOut => "TIMED_OUT",
            ExecutionState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Error taxonomy shared by every stage of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    RobotOffline,
    RobotBusy,
    ActionInvalid,
    ParamInvalid,
    HardwareFault,
    Timeout,
    SafetyViolation,
    EstopFailed,
    Internal,
}

impl ErrorKind {
    /// Only hardware faults and timeouts are retried by the executor
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorKind::HardwareFault | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::RobotOffline => "ROBOT_OFFLINE",
            ErrorKind::RobotBusy => "ROBOT_BUSY",
            ErrorKind::ActionInvalid => "ACTION_INVALID",
            ErrorKind::ParamInvalid => "PARAM_INVALID",
            ErrorKind::HardwareFault => "HARDWARE_FAULT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::SafetyViolation => "SAFETY_VIOLATION",
            ErrorKind::EstopFailed => "ESTOP_FAILED",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// Structured error surfaced to callers
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
    /// Offending request field, for validation errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Failing step of a composite command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
            step: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

/// Result payload recorded on a terminal execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResult {
    /// Robot acknowledged with a result payload
    Completed { payload: Value },
    /// Execution failed or timed out
    Failed { error: CommandError },
    /// Cancelled by request or by emergency preemption
    Cancelled { reason: String },
}

impl CommandResult {
    pub fn error(&self) -> Option<&CommandError> {
        match self {
            CommandResult::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Response mirroring the terminal (or current) state of a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command_id: String,
    pub trace_id: String,
    pub state: ExecutionState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_robot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
}

/// Acknowledgement returned synchronously on submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub command_id: String,
    pub trace_id: String,
    pub state: ExecutionState,
    /// The id was already known; nothing was re-executed
    pub duplicate: bool,
}

/// Transport family used to reach a robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Mqtt,
    Http,
    WebSocket,
    Tcp,
    Sim,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Mqtt => write!(f, "MQTT"),
            TransportKind::Http => write!(f, "HTTP"),
            TransportKind::WebSocket => write!(f, "WebSocket"),
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Sim => write!(f, "Sim"),
        }
    }
}

/// Frames exchanged on the robot link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum LinkFrame {
    /// Robot -> MCP: announce identity and capabilities
    Register {
        robot_id: String,
        #[serde(default)]
        robot_type: Option<String>,
        capabilities: Vec<String>,
    },
    /// MCP -> robot: registration accepted
    Registered { robot_id: String },
    /// Robot -> MCP: liveness
    Heartbeat {
        robot_id: String,
        uptime_ms: u64,
        healthy: bool,
    },
    /// MCP -> robot: execute one primitive
    Deliver {
        delivery_id: u64,
        command: PrimitiveCommand,
    },
    /// MCP -> robot: abandon a pending delivery
    Abort { delivery_id: u64 },
    /// Robot -> MCP: positive result
    Ack {
        delivery_id: u64,
        #[serde(default)]
        payload: Value,
    },
    /// Robot -> MCP: execution fault
    Fault {
        delivery_id: u64,
        kind: ErrorKind,
        message: String,
    },
}

/// Requests accepted on the intake port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IntakeFrame {
    Submit { request: Value },
    Cancel { command_id: String },
    Status { command_id: String },
    Wait { command_id: String, timeout_ms: u64 },
}

/// Replies sent on the intake port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum IntakeReply {
    Accepted { receipt: SubmitReceipt },
    Rejected { error: CommandError },
    Outcome { outcome: CommandOutcome },
    NotFound { command_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_order_and_parse() {
        assert!(Priority::Emergency > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::parse("high"), Some(Priority::High));
        assert_eq!(Priority::parse("Emergency"), Some(Priority::Emergency));
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn test_retriable_kinds() {
        assert!(ErrorKind::HardwareFault.is_retriable());
        assert!(ErrorKind::Timeout.is_retriable());
        assert!(!ErrorKind::SafetyViolation.is_retriable());
        assert!(!ErrorKind::EstopFailed.is_retriable());
        assert!(!ErrorKind::ParamInvalid.is_retriable());
    }

    #[test]
    fn test_error_wire_names() {
        let err = CommandError::new(ErrorKind::EstopFailed, "no ack").with_step("quad-2");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "ESTOP_FAILED");
        assert_eq!(value["step"], "quad-2");
        assert!(value.get("field").is_none());
        assert_eq!(err.to_string(), "ESTOP_FAILED: no ack");
    }

    #[test]
    fn test_link_frame_tagging() {
        let frame: LinkFrame = serde_json::from_value(json!({
            "frame": "fault",
            "delivery_id": 7,
            "kind": "HARDWARE_FAULT",
            "message": "servo stalled"
        }))
        .unwrap();
        assert_eq!(
            frame,
            LinkFrame::Fault {
                delivery_id: 7,
                kind: ErrorKind::HardwareFault,
                message: "servo stalled".into()
            }
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionState::Queued.is_terminal());
        assert!(!ExecutionState::InProgress.is_terminal());
        assert!(ExecutionState::TimedOut.is_terminal());
        assert!(ExecutionState::Cancelled.is_terminal());
        assert_eq!(ExecutionState::InProgress.to_string(), "IN_PROGRESS");
    }
}
