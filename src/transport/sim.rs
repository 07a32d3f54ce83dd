//! In-process simulated robots
//!
//! Each simulated robot answers deliveries according to a scripted
//! behavior, per action or as a default. Deliveries and aborts are logged
//! so callers can inspect what reached the "hardware".

use super::{DeliveryEvent, DeliveryHandle, TransportAdapter, TransportError};
use crate::router::{ConnectionHandle, RobotBinding, RobotRouter};
use async_trait::async_trait;
use mcp_shared::{ErrorKind, Params, PrimitiveCommand, TransportKind};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::interval_at;
use tracing::{debug, info};

/// How a simulated robot answers a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum SimBehavior {
    /// Acknowledge after a delay
    Ack { latency: Duration },
    /// Report a fault after a delay
    Fault {
        kind: ErrorKind,
        message: String,
        latency: Duration,
    },
    /// Never answer
    Silent,
    /// Drop the link after a delay; the robot stops heartbeating
    Disconnect { latency: Duration },
    /// Fail with a hardware fault the first `failures` times, then ack
    FlakyThenAck { failures: u32, latency: Duration },
}

impl SimBehavior {
    pub fn ack_after(latency_ms: u64) -> Self {
        SimBehavior::Ack {
            latency: Duration::from_millis(latency_ms),
        }
    }

    pub fn fault(kind: ErrorKind, message: impl Into<String>) -> Self {
        SimBehavior::Fault {
            kind,
            message: message.into(),
            latency: Duration::from_millis(10),
        }
    }
}

/// One delivery as seen by a simulated robot
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub robot_id: String,
    pub command_id: String,
    pub action: String,
    pub params: Params,
    pub at: Instant,
}

struct SimRobot {
    default: SimBehavior,
    per_action: HashMap<String, SimBehavior>,
    calls: HashMap<String, u32>,
    online: bool,
}

#[derive(Default)]
struct SimLog {
    deliveries: Vec<DeliveryRecord>,
    aborted: Vec<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimAdapter {
    router: Arc<RobotRouter>,
    robots: Mutex<HashMap<String, SimRobot>>,
    log: Arc<Mutex<SimLog>>,
    next_delivery: AtomicU64,
    next_connection: AtomicU64,
}

impl SimAdapter {
    pub fn new(router: Arc<RobotRouter>) -> Self {
        Self {
            router,
            robots: Mutex::new(HashMap::new()),
            log: Arc::new(Mutex::new(SimLog::default())),
            next_delivery: AtomicU64::new(1),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Create a simulated robot and register it with the router
    pub fn add_robot(
        &self,
        robot_id: &str,
        robot_type: Option<String>,
        capabilities: Vec<String>,
        behavior: SimBehavior,
    ) {
        lock(&self.robots).insert(
            robot_id.to_string(),
            SimRobot {
                default: behavior,
                per_action: HashMap::new(),
                calls: HashMap::new(),
                online: true,
            },
        );
        let connection = ConnectionHandle(self.next_connection.fetch_add(1, Ordering::Relaxed));
        self.router
            .register(robot_id, robot_type, capabilities, TransportKind::Sim, connection);
    }

    /// Script one action on one robot
    pub fn set_behavior(&self, robot_id: &str, action: &str, behavior: SimBehavior) {
        if let Some(robot) = lock(&self.robots).get_mut(robot_id) {
            robot.per_action.insert(action.to_string(), behavior);
        }
    }

    pub fn set_default(&self, robot_id: &str, behavior: SimBehavior) {
        if let Some(robot) = lock(&self.robots).get_mut(robot_id) {
            robot.default = behavior;
        }
    }

    /// Take a robot off the air (no heartbeats, deliveries refused) or back on
    pub fn set_online(&self, robot_id: &str, online: bool) {
        if let Some(robot) = lock(&self.robots).get_mut(robot_id) {
            robot.online = online;
        }
        if online {
            self.router.heartbeat(robot_id);
        }
    }

    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        lock(&self.log).deliveries.clone()
    }

    /// Command ids whose deliveries were aborted before answering
    pub fn aborted(&self) -> Vec<String> {
        lock(&self.log).aborted.clone()
    }

    /// Heartbeat every online robot on a fixed interval
    pub async fn run_heartbeats(self: Arc<Self>, period: Duration) {
        // Registration counts as the first beat
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let online: Vec<String> = lock(&self.robots)
                .iter()
                .filter(|(_, r)| r.online)
                .map(|(id, _)| id.clone())
                .collect();
            for robot_id in online {
                self.router.heartbeat(&robot_id);
            }
        }
    }

    /// Pick the behavior for this delivery, resolving flaky counters
    fn behavior_for(&self, robot_id: &str, action: &str) -> Result<SimBehavior, TransportError> {
        let mut robots = lock(&self.robots);
        let robot = robots
            .get_mut(robot_id)
            .filter(|r| r.online)
            .ok_or_else(|| TransportError::NotConnected(robot_id.to_string()))?;

        let behavior = robot
            .per_action
            .get(action)
            .cloned()
            .unwrap_or_else(|| robot.default.clone());
        let calls = robot.calls.entry(action.to_string()).or_insert(0);
        *calls += 1;

        Ok(match behavior {
            SimBehavior::FlakyThenAck { failures, latency } if *calls <= failures => SimBehavior::Fault {
                kind: ErrorKind::HardwareFault,
                message: format!("transient fault {}/{}", calls, failures),
                latency,
            },
            SimBehavior::FlakyThenAck { latency, .. } => SimBehavior::Ack { latency },
            SimBehavior::Disconnect { latency } => {
                robot.online = false;
                SimBehavior::Disconnect { latency }
            }
            other => other,
        })
    }
}

#[async_trait]
impl TransportAdapter for SimAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Sim
    }

    async fn deliver(
        &self,
        binding: &RobotBinding,
        command: &PrimitiveCommand,
    ) -> Result<DeliveryHandle, TransportError> {
        let robot_id = binding.robot_id.clone();
        let behavior = self.behavior_for(&robot_id, &command.action)?;

        lock(&self.log).deliveries.push(DeliveryRecord {
            robot_id: robot_id.clone(),
            command_id: command.command_id.clone(),
            action: command.action.clone(),
            params: command.params.clone(),
            at: Instant::now(),
        });

        let delivery_id = self.next_delivery.fetch_add(1, Ordering::Relaxed);
        let (handle, responder) = DeliveryHandle::new(delivery_id);
        let (events, mut abort) = responder.into_parts();
        debug!(
            "[SIM] {} <- {} ({}) as {:?}",
            robot_id, command.command_id, command.action, behavior
        );

        let (latency, event) = match behavior {
            SimBehavior::Ack { latency } => (
                Some(latency),
                DeliveryEvent::Ack {
                    payload: json!({ "robot_id": robot_id, "action": command.action }),
                },
            ),
            SimBehavior::Fault {
                kind,
                message,
                latency,
            } => (Some(latency), DeliveryEvent::Fault { kind, message }),
            SimBehavior::Disconnect { latency } => (
                Some(latency),
                DeliveryEvent::Disconnected {
                    reason: format!("simulated link loss on {}", robot_id),
                },
            ),
            SimBehavior::Silent | SimBehavior::FlakyThenAck { .. } => (
                None,
                DeliveryEvent::Disconnected {
                    reason: String::new(),
                },
            ),
        };

        let log = self.log.clone();
        let command_id = command.command_id.clone();
        tokio::spawn(async move {
            let answer = async {
                match latency {
                    Some(latency) => tokio::time::sleep(latency).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = answer => {
                    if let DeliveryEvent::Disconnected { reason } = &event {
                        info!("[SIM] {}", reason);
                    }
                    let _ = events.send(event);
                }
                aborted = &mut abort => {
                    // Err means the executor dropped the handle without aborting
                    if aborted.is_ok() {
                        lock(&log).aborted.push(command_id);
                    }
                }
            }
        });

        Ok(handle)
    }
}
