//! Built-in composite commands

use super::{Plugin, PrimitiveStep, StepTemplate};
use crate::validator::{ParamKind, ParamSpec};
use mcp_shared::Params;
use serde_json::{json, Value};

/// `patrol`: walk a closed polygon `laps` times
pub fn patrol() -> Plugin {
    Plugin::function(
        "patrol",
        expand_patrol,
        vec![
            ParamSpec::optional("laps", ParamKind::Integer { min: 1, max: 20 }),
            ParamSpec::optional("sides", ParamKind::Integer { min: 3, max: 8 }),
            ParamSpec::optional("leg_m", ParamKind::Number { min: 0.1, max: 10.0 }),
            ParamSpec::optional("speed_mps", ParamKind::Number { min: 0.05, max: 2.0 }),
        ],
    )
}

fn expand_patrol(params: &Params) -> Result<Vec<PrimitiveStep>, String> {
    let laps = params.get("laps").and_then(Value::as_u64).unwrap_or(1);
    let sides = params.get("sides").and_then(Value::as_u64).unwrap_or(4);
    let leg_m = params.get("leg_m").and_then(Value::as_f64).unwrap_or(2.0);
    if sides < 3 {
        return Err(format!("a patrol needs at least 3 sides, got {}", sides));
    }
    let turn = 360.0 / sides as f64;

    let mut steps = Vec::with_capacity((laps * sides * 2) as usize);
    for _ in 0..laps {
        for _ in 0..sides {
            let mut move_params = Params::new();
            move_params.insert("distance_m".into(), json!(leg_m));
            if let Some(speed) = params.get("speed_mps") {
                move_params.insert("speed_mps".into(), speed.clone());
            }
            steps.push(PrimitiveStep::new("motion.move", move_params));

            let mut turn_params = Params::new();
            turn_params.insert("angle_deg".into(), json!(turn));
            steps.push(PrimitiveStep::new("motion.turn", turn_params));
        }
    }
    Ok(steps)
}

/// `greet`: wave, then nod
pub fn greet() -> Plugin {
    Plugin::sequence(
        "greet",
        vec![
            StepTemplate::new("gesture.wave").pass("duration_ms"),
            StepTemplate::new("gesture.nod").pass("count"),
        ],
    )
    .with_params(vec![
        ParamSpec::optional("duration_ms", ParamKind::Integer { min: 100, max: 10_000 }),
        ParamSpec::optional("count", ParamKind::Integer { min: 1, max: 10 }),
    ])
}
