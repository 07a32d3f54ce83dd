//! Known primitive actions and their parameter schemas

use mcp_shared::{Params, EMERGENCY_STOP};
use serde_json::Value;
use std::collections::HashMap;

/// Value constraint for one parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    Number { min: f64, max: f64 },
    Integer { min: i64, max: i64 },
    Text { max_len: usize },
    Bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        match &self.kind {
            ParamKind::Number { min, max } => {
                let n = value.as_f64().ok_or("expected a number")?;
                if n < *min || n > *max {
                    return Err(format!("{} is outside [{}, {}]", n, min, max));
                }
            }
            ParamKind::Integer { min, max } => {
                let n = value.as_i64().ok_or("expected an integer")?;
                if n < *min || n > *max {
                    return Err(format!("{} is outside [{}, {}]", n, min, max));
                }
            }
            ParamKind::Text { max_len } => {
                let s = value.as_str().ok_or("expected a string")?;
                if s.is_empty() || s.len() > *max_len {
                    return Err(format!("length must be 1..={}", max_len));
                }
            }
            ParamKind::Bool => {
                value.as_bool().ok_or("expected a boolean")?;
            }
        }
        Ok(())
    }
}

/// A parameter that failed its schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamViolation {
    pub key: String,
    pub reason: String,
}

/// Check `params` against a schema: required keys, value ranges, no strays
pub fn check_params(schema: &[ParamSpec], params: &Params) -> Result<(), ParamViolation> {
    for spec in schema {
        match params.get(spec.name) {
            Some(value) => spec.check(value).map_err(|reason| ParamViolation {
                key: spec.name.to_string(),
                reason,
            })?,
            None if spec.required => {
                return Err(ParamViolation {
                    key: spec.name.to_string(),
                    reason: "required parameter is missing".into(),
                })
            }
            None => {}
        }
    }

    if let Some(stray) = params.keys().find(|k| !schema.iter().any(|s| s.name == k.as_str())) {
        return Err(ParamViolation {
            key: stray.clone(),
            reason: "unknown parameter".into(),
        });
    }

    Ok(())
}

/// A primitive action robots understand
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub description: &'static str,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, params: Vec<ParamSpec>, description: &'static str) -> Self {
        Self {
            name: name.into(),
            params,
            description,
        }
    }
}

/// Table of known primitive actions
#[derive(Debug, Clone, Default)]
pub struct ActionCatalog {
    actions: HashMap<String, ActionSpec>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard motion, gesture, sensor and system actions
    pub fn builtin() -> Self {
        use ParamKind::*;

        let mut catalog = Self::new();
        catalog.register(ActionSpec::new(
            "motion.move",
            vec![
                ParamSpec::required("distance_m", Number { min: -10.0, max: 10.0 }),
                ParamSpec::optional("speed_mps", Number { min: 0.05, max: 2.0 }),
            ],
            "Drive forward (or backward) a fixed distance",
        ));
        catalog.register(ActionSpec::new(
            "motion.turn",
            vec![
                ParamSpec::required("angle_deg", Number { min: -360.0, max: 360.0 }),
                ParamSpec::optional("rate_dps", Number { min: 1.0, max: 180.0 }),
            ],
            "Rotate in place",
        ));
        catalog.register(ActionSpec::new("motion.stop", vec![], "Controlled stop"));
        catalog.register(ActionSpec::new(
            "gesture.wave",
            vec![ParamSpec::optional("duration_ms", Integer { min: 100, max: 10_000 })],
            "Wave an arm",
        ));
        catalog.register(ActionSpec::new(
            "gesture.nod",
            vec![ParamSpec::optional("count", Integer { min: 1, max: 10 })],
            "Nod the head",
        ));
        catalog.register(ActionSpec::new(
            "sensor.read",
            vec![ParamSpec::required("sensor", Text { max_len: 64 })],
            "Read a named sensor",
        ));
        catalog.register(ActionSpec::new(
            "actuator.set",
            vec![
                ParamSpec::required("actuator", Text { max_len: 64 }),
                ParamSpec::required("value", Number { min: -1.0e6, max: 1.0e6 }),
            ],
            "Drive a named actuator to a value",
        ));
        catalog.register(ActionSpec::new("system.status", vec![], "Report robot status"));
        catalog.register(ActionSpec::new(
            EMERGENCY_STOP,
            vec![ParamSpec::optional("reason", Text { max_len: 256 })],
            "Immediately halt all motion",
        ));
        catalog
    }

    pub fn register(&mut self, spec: ActionSpec) {
        self.actions.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }
}
