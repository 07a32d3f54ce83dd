//! Plugin registry
//!
//! Maps a command type to an expansion into primitive steps. Plugins come in
//! a closed set of variants that share one expansion contract:
//! - `Sequence`: a fixed ordered list of steps (command-composing)
//! - `Device`: a single read/actuate primitive (device-driving)
//! - `Function`: a plain function computing the steps from the params

mod builtin;

use crate::validator::ParamSpec;
use mcp_shared::{CommandError, ErrorKind, Params};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

pub use builtin::{greet, patrol};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("no plugin registered for '{0}'")]
    NotFound(String),

    #[error("plugin '{plugin}' cannot expand: {reason}")]
    InvalidParams { plugin: String, reason: String },
}

impl From<PluginError> for CommandError {
    fn from(err: PluginError) -> Self {
        let kind = match err {
            PluginError::NotFound(_) => ErrorKind::ActionInvalid,
            PluginError::InvalidParams { .. } => ErrorKind::ParamInvalid,
        };
        CommandError::new(kind, err.to_string())
    }
}

/// One primitive action produced by an expansion
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveStep {
    pub action: String,
    pub params: Params,
}

impl PrimitiveStep {
    pub fn new(action: impl Into<String>, params: Params) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }
}

/// Step template for sequence plugins
#[derive(Debug, Clone, PartialEq)]
pub struct StepTemplate {
    pub action: String,
    /// Fixed parameters
    pub params: Params,
    /// Keys copied from the parent command's params when present
    pub pass_through: Vec<String>,
}

impl StepTemplate {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Params::new(),
            pass_through: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn pass(mut self, key: &str) -> Self {
        self.pass_through.push(key.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOperation {
    Read,
    Actuate,
}

/// Expansion function for computed plugins
pub type ExpandFn = fn(&Params) -> Result<Vec<PrimitiveStep>, String>;

#[derive(Debug, Clone)]
pub enum PluginKind {
    Sequence(Vec<StepTemplate>),
    Device {
        device: String,
        operation: DeviceOperation,
    },
    Function(ExpandFn),
}

/// A registered composite command type
#[derive(Debug, Clone)]
pub struct Plugin {
    pub name: String,
    pub kind: PluginKind,
    /// Schema for the composite's own params
    pub params: Vec<ParamSpec>,
}

impl Plugin {
    pub fn sequence(name: impl Into<String>, steps: Vec<StepTemplate>) -> Self {
        Self {
            name: name.into(),
            kind: PluginKind::Sequence(steps),
            params: Vec::new(),
        }
    }

    pub fn device(name: impl Into<String>, device: impl Into<String>, operation: DeviceOperation) -> Self {
        let params = match operation {
            DeviceOperation::Read => Vec::new(),
            DeviceOperation::Actuate => vec![ParamSpec::required(
                "value",
                crate::validator::ParamKind::Number { min: -1.0e6, max: 1.0e6 },
            )],
        };
        Self {
            name: name.into(),
            kind: PluginKind::Device {
                device: device.into(),
                operation,
            },
            params,
        }
    }

    pub fn function(name: impl Into<String>, expand: ExpandFn, params: Vec<ParamSpec>) -> Self {
        Self {
            name: name.into(),
            kind: PluginKind::Function(expand),
            params,
        }
    }

    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }

    fn expand(&self, params: &Params) -> Result<Vec<PrimitiveStep>, PluginError> {
        let steps = match &self.kind {
            PluginKind::Sequence(templates) => templates
                .iter()
                .map(|t| {
                    let mut step_params = t.params.clone();
                    for key in &t.pass_through {
                        if let Some(value) = params.get(key) {
                            step_params.insert(key.clone(), value.clone());
                        }
                    }
                    PrimitiveStep::new(t.action.clone(), step_params)
                })
                .collect(),
            PluginKind::Device { device, operation } => {
                let mut step_params = Params::new();
                let action = match operation {
                    DeviceOperation::Read => {
                        step_params.insert("sensor".into(), Value::from(device.as_str()));
                        "sensor.read"
                    }
                    DeviceOperation::Actuate => {
                        step_params.insert("actuator".into(), Value::from(device.as_str()));
                        let value = params.get("value").cloned().ok_or_else(|| {
                            PluginError::InvalidParams {
                                plugin: self.name.clone(),
                                reason: "missing 'value'".into(),
                            }
                        })?;
                        step_params.insert("value".into(), value);
                        "actuator.set"
                    }
                };
                vec![PrimitiveStep::new(action, step_params)]
            }
            PluginKind::Function(expand) => {
                expand(params).map_err(|reason| PluginError::InvalidParams {
                    plugin: self.name.clone(),
                    reason,
                })?
            }
        };

        if steps.is_empty() {
            return Err(PluginError::InvalidParams {
                plugin: self.name.clone(),
                reason: "expansion produced no steps".into(),
            });
        }
        Ok(steps)
    }
}

/// Registered plugins keyed by command type
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Plugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `patrol` and `greet`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(patrol());
        registry.register(greet());
        registry
    }

    /// Register (or replace) a plugin
    pub fn register(&mut self, plugin: Plugin) {
        self.plugins.insert(plugin.name.clone(), plugin);
    }

    pub fn get(&self, command_type: &str) -> Option<&Plugin> {
        self.plugins.get(command_type)
    }

    pub fn contains(&self, command_type: &str) -> bool {
        self.plugins.contains_key(command_type)
    }

    /// Expand a composite command type into its primitive steps
    pub fn expand(&self, command_type: &str, params: &Params) -> Result<Vec<PrimitiveStep>, PluginError> {
        self.plugins
            .get(command_type)
            .ok_or_else(|| PluginError::NotFound(command_type.to_string()))?
            .expand(params)
    }
}
