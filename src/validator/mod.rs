//! Command validation
//!
//! Enforces the intake contract before anything else runs. Checks run in a
//! fixed order: required fields and types, known command type, parameter
//! schema, then authorization token format. Every outcome is audited.

mod catalog;

use crate::events::{EventKind, EventSink, LifecycleEvent};
use crate::plugins::PluginRegistry;
use mcp_shared::{Actor, Command, CommandError, ErrorKind, Params, Priority, Target, EMERGENCY_STOP};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

pub use catalog::{check_params, ActionCatalog, ActionSpec, ParamKind, ParamSpec, ParamViolation};

const TOKEN_MIN_LEN: usize = 16;
const TOKEN_MAX_LEN: usize = 4096;

/// A rejected request, naming the offending field
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<ValidationError> for CommandError {
    fn from(err: ValidationError) -> Self {
        CommandError::new(ErrorKind::Validation, err.reason).with_field(err.field)
    }
}

/// A request that passed every check
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCommand {
    pub command: Command,
    pub actor: Actor,
    pub source: String,
    pub timestamp_ms: u64,
    /// The type is a plugin composite rather than a primitive
    pub composite: bool,
}

pub struct CommandValidator {
    catalog: Arc<ActionCatalog>,
    plugins: Arc<PluginRegistry>,
    sink: Arc<dyn EventSink>,
    min_timeout_ms: u64,
    max_timeout_ms: u64,
}

impl CommandValidator {
    pub fn new(
        catalog: Arc<ActionCatalog>,
        plugins: Arc<PluginRegistry>,
        sink: Arc<dyn EventSink>,
        min_timeout_ms: u64,
        max_timeout_ms: u64,
    ) -> Self {
        Self {
            catalog,
            plugins,
            sink,
            min_timeout_ms,
            max_timeout_ms,
        }
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    /// Validate a raw intake request
    pub fn validate(&self, raw: &Value) -> Result<ValidatedCommand, ValidationError> {
        let result = self.check(raw);

        let trace_id = raw
            .get("trace_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let correlation_id = raw
            .pointer("/command/id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let kind = match &result {
            Ok(_) => EventKind::ValidationPassed,
            Err(err) => EventKind::ValidationFailed {
                field: err.field.clone(),
                reason: err.reason.clone(),
            },
        };
        self.sink.emit(LifecycleEvent::new(trace_id, correlation_id, kind));

        result
    }

    fn check(&self, raw: &Value) -> Result<ValidatedCommand, ValidationError> {
        // (a) required fields, correctly typed
        let request = raw
            .as_object()
            .ok_or_else(|| ValidationError::new("request", "expected a JSON object"))?;

        let trace_id = required_str(request, "trace_id", "trace_id")?;
        let timestamp_ms = request
            .get("timestamp")
            .and_then(Value::as_u64)
            .ok_or_else(|| ValidationError::new("timestamp", "expected a non-negative integer"))?;
        let actor = parse_actor(request.get("actor"))?;
        let source = required_str(request, "source", "source")?;

        let command = request
            .get("command")
            .and_then(Value::as_object)
            .ok_or_else(|| ValidationError::new("command", "expected an object"))?;
        let id = required_str(command, "id", "command.id")?;
        let command_type = required_str(command, "type", "command.type")?;
        let target = parse_target(command.get("target"))?;
        let is_stop = command_type == EMERGENCY_STOP;

        let timeout_ms = match command.get("timeout_ms") {
            // The stop runs against its own fixed bound
            None if is_stop => self.min_timeout_ms,
            Some(value) => value
                .as_u64()
                .filter(|t| *t > 0)
                .ok_or_else(|| ValidationError::new("command.timeout_ms", "expected a positive integer"))?,
            None => return Err(ValidationError::new("command.timeout_ms", "required field is missing")),
        };
        if !is_stop && (timeout_ms < self.min_timeout_ms || timeout_ms > self.max_timeout_ms) {
            return Err(ValidationError::new(
                "command.timeout_ms",
                format!("must be within {}..={}", self.min_timeout_ms, self.max_timeout_ms),
            ));
        }

        let params = match command.get("params") {
            None | Some(Value::Null) => Params::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(ValidationError::new("command.params", "expected an object")),
        };

        let priority = match command.get("priority") {
            _ if is_stop => Priority::Emergency,
            None => Priority::Normal,
            Some(Value::String(name)) => Priority::parse(name).ok_or_else(|| {
                ValidationError::new("command.priority", format!("unknown priority '{}'", name))
            })?,
            Some(_) => return Err(ValidationError::new("command.priority", "expected a string")),
        };

        // (b) known action or registered composite
        let composite = !is_stop && self.plugins.contains(&command_type);
        if !is_stop && !composite && !self.catalog.contains(&command_type) {
            return Err(ValidationError::new(
                "command.type",
                format!("'{}' is neither a known action nor a registered plugin", command_type),
            ));
        }
        if target == Target::All && !is_stop {
            return Err(ValidationError::new(
                "command.target",
                "'all' is reserved for the emergency stop",
            ));
        }

        // (c) parameter schema
        let schema: &[ParamSpec] = if composite {
            self.plugins
                .get(&command_type)
                .map(|p| p.params.as_slice())
                .unwrap_or_default()
        } else {
            self.catalog
                .get(&command_type)
                .map(|a| a.params.as_slice())
                .unwrap_or_default()
        };
        check_params(schema, &params).map_err(|violation| {
            ValidationError::new(format!("command.params.{}", violation.key), violation.reason)
        })?;

        // (d) authorization token format; permission is checked elsewhere
        check_token(request.get("auth_token"))?;

        Ok(ValidatedCommand {
            command: Command {
                id,
                command_type,
                target,
                params,
                timeout_ms,
                priority,
                trace_id,
            },
            actor,
            source,
            timestamp_ms,
            composite,
        })
    }
}

fn required_str(map: &Map<String, Value>, key: &str, field: &str) -> Result<String, ValidationError> {
    match map.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(ValidationError::new(field, "must not be empty")),
        Some(_) => Err(ValidationError::new(field, "expected a string")),
        None => Err(ValidationError::new(field, "required field is missing")),
    }
}

fn parse_actor(value: Option<&Value>) -> Result<Actor, ValidationError> {
    let actor = value
        .and_then(Value::as_object)
        .ok_or_else(|| ValidationError::new("actor", "expected an object with type and id"))?;
    Ok(Actor {
        actor_type: required_str(actor, "type", "actor.type")?,
        id: required_str(actor, "id", "actor.id")?,
    })
}

fn parse_target(value: Option<&Value>) -> Result<Target, ValidationError> {
    const FIELD: &str = "command.target";

    match value {
        None => Err(ValidationError::new(FIELD, "required field is missing")),
        Some(Value::String(s)) if s == "all" => Ok(Target::All),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(Target::robot(s.clone())),
        Some(Value::Object(map)) => {
            if let Some(robot_id) = map.get("robot_id") {
                return match robot_id {
                    Value::String(id) if !id.trim().is_empty() => Ok(Target::robot(id.clone())),
                    _ => Err(ValidationError::new("command.target.robot_id", "expected a non-empty string")),
                };
            }

            let robot_type = match map.get("type") {
                None => None,
                Some(Value::String(t)) if !t.is_empty() => Some(t.clone()),
                Some(_) => return Err(ValidationError::new("command.target.type", "expected a non-empty string")),
            };
            let mut capabilities = Vec::new();
            for key in ["capability", "capabilities"] {
                match map.get(key) {
                    None => {}
                    Some(Value::String(c)) => capabilities.push(c.clone()),
                    Some(Value::Array(items)) => {
                        for item in items {
                            let cap = item.as_str().ok_or_else(|| {
                                ValidationError::new(format!("command.target.{}", key), "expected strings")
                            })?;
                            capabilities.push(cap.to_string());
                        }
                    }
                    Some(_) => {
                        return Err(ValidationError::new(
                            format!("command.target.{}", key),
                            "expected a string or array of strings",
                        ))
                    }
                }
            }

            if robot_type.is_none() && capabilities.is_empty() {
                return Err(ValidationError::new(
                    FIELD,
                    "expected robot_id, or type and/or capability",
                ));
            }
            Ok(Target::Query {
                robot_type,
                capabilities,
            })
        }
        Some(_) => Err(ValidationError::new(FIELD, "expected a robot id, 'all', or a query object")),
    }
}

fn check_token(value: Option<&Value>) -> Result<(), ValidationError> {
    const FIELD: &str = "auth_token";

    let token = match value {
        Some(Value::String(t)) => t.strip_prefix("Bearer ").unwrap_or(t),
        Some(_) => return Err(ValidationError::new(FIELD, "expected a string")),
        None => return Err(ValidationError::new(FIELD, "required field is missing")),
    };

    if token.len() < TOKEN_MIN_LEN || token.len() > TOKEN_MAX_LEN {
        return Err(ValidationError::new(
            FIELD,
            format!("length must be {}..={}", TOKEN_MIN_LEN, TOKEN_MAX_LEN),
        ));
    }

    let body = token.trim_end_matches('=');
    let well_formed = !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '+' | '/'));
    if !well_formed {
        return Err(ValidationError::new(FIELD, "contains characters outside the token alphabet"));
    }
    Ok(())
}
