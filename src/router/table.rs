//! Robot binding table
//!
//! Arena of bindings keyed by `robot_id`, each behind its own lock. Router
//! and executor reach entries only through the accessor methods here and get
//! cloned snapshots back, never references into the table.

use mcp_shared::TransportKind;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Opaque token an adapter uses to find its connection for a robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Unhealthy,
}

/// Snapshot of a robot's live association
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RobotBinding {
    pub robot_id: String,
    pub robot_type: Option<String>,
    pub transport: TransportKind,
    pub connection: ConnectionHandle,
    pub capabilities: BTreeSet<String>,
    pub health: Health,
}

impl RobotBinding {
    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }

    /// Check type and capability constraints of a query
    pub fn matches(&self, robot_type: Option<&str>, capabilities: &[String]) -> bool {
        if let Some(wanted) = robot_type {
            if self.robot_type.as_deref() != Some(wanted) {
                return false;
            }
        }
        capabilities.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Binding plus bookkeeping, as reported by `snapshot`
#[derive(Debug, Clone, Serialize)]
pub struct BindingStatus {
    pub binding: RobotBinding,
    pub in_flight: usize,
    pub last_used: u64,
    pub since_heartbeat_ms: u64,
    pub unhealthy_reason: Option<String>,
}

struct SlotState {
    binding: RobotBinding,
    last_heartbeat: Instant,
    /// Logical clock value of the last routing selection
    last_used: u64,
    in_flight: usize,
    unhealthy_reason: Option<String>,
}

struct BindingSlot {
    state: Mutex<SlotState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct BindingTable {
    slots: RwLock<HashMap<String, Arc<BindingSlot>>>,
    clock: AtomicU64,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, robot_id: &str) -> Option<Arc<BindingSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(robot_id)
            .cloned()
    }

    fn all_slots(&self) -> Vec<Arc<BindingSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Insert or refresh a binding; returns true if the robot was new
    pub fn upsert(&self, binding: RobotBinding) -> bool {
        if let Some(slot) = self.slot(&binding.robot_id) {
            let mut state = lock(&slot.state);
            state.binding = RobotBinding {
                health: Health::Healthy,
                ..binding
            };
            state.last_heartbeat = Instant::now();
            state.unhealthy_reason = None;
            return false;
        }

        let robot_id = binding.robot_id.clone();
        let slot = Arc::new(BindingSlot {
            state: Mutex::new(SlotState {
                binding: RobotBinding {
                    health: Health::Healthy,
                    ..binding
                },
                last_heartbeat: Instant::now(),
                last_used: 0,
                in_flight: 0,
                unhealthy_reason: None,
            }),
        });
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        // A concurrent upsert of the same robot keeps the first slot
        slots.entry(robot_id).or_insert(slot);
        true
    }

    /// Record a heartbeat; an unhealthy binding becomes healthy again
    pub fn heartbeat(&self, robot_id: &str) -> bool {
        match self.slot(robot_id) {
            Some(slot) => {
                let mut state = lock(&slot.state);
                state.last_heartbeat = Instant::now();
                state.binding.health = Health::Healthy;
                state.unhealthy_reason = None;
                true
            }
            None => false,
        }
    }

    /// Flip a binding to unhealthy; returns true if it was healthy
    pub fn mark_unhealthy(&self, robot_id: &str, reason: &str) -> bool {
        match self.slot(robot_id) {
            Some(slot) => {
                let mut state = lock(&slot.state);
                let was_healthy = state.binding.is_healthy();
                state.binding.health = Health::Unhealthy;
                state.unhealthy_reason = Some(reason.to_string());
                was_healthy
            }
            None => false,
        }
    }

    /// Mark healthy bindings whose last heartbeat is older than `window`
    pub fn mark_stale(&self, window: Duration) -> Vec<String> {
        let mut stale = Vec::new();
        for slot in self.all_slots() {
            let mut state = lock(&slot.state);
            if state.binding.is_healthy() && state.last_heartbeat.elapsed() > window {
                state.binding.health = Health::Unhealthy;
                state.unhealthy_reason = Some(format!(
                    "no heartbeat for {}ms",
                    state.last_heartbeat.elapsed().as_millis()
                ));
                stale.push(state.binding.robot_id.clone());
            }
        }
        stale.sort();
        stale
    }

    pub fn get(&self, robot_id: &str) -> Option<RobotBinding> {
        self.slot(robot_id).map(|slot| lock(&slot.state).binding.clone())
    }

    /// Bindings passing `filter`, with in-flight count and LRU stamp
    pub fn select<F>(&self, filter: F) -> Vec<(RobotBinding, usize, u64)>
    where
        F: Fn(&RobotBinding) -> bool,
    {
        self.all_slots()
            .iter()
            .filter_map(|slot| {
                let state = lock(&slot.state);
                filter(&state.binding).then(|| (state.binding.clone(), state.in_flight, state.last_used))
            })
            .collect()
    }

    /// Stamp a binding as just used
    pub fn touch(&self, robot_id: &str) {
        if let Some(slot) = self.slot(robot_id) {
            let stamp = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
            lock(&slot.state).last_used = stamp;
        }
    }

    pub fn in_flight(&self, robot_id: &str) -> usize {
        self.slot(robot_id)
            .map(|slot| lock(&slot.state).in_flight)
            .unwrap_or(0)
    }

    /// Take one in-flight slot if the robot is below `limit`
    pub fn try_acquire(&self, robot_id: &str, limit: usize) -> bool {
        match self.slot(robot_id) {
            Some(slot) => {
                let mut state = lock(&slot.state);
                if state.in_flight < limit {
                    state.in_flight += 1;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn release(&self, robot_id: &str) {
        if let Some(slot) = self.slot(robot_id) {
            let mut state = lock(&slot.state);
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }

    pub fn snapshot(&self) -> Vec<BindingStatus> {
        let mut statuses: Vec<BindingStatus> = self
            .all_slots()
            .iter()
            .map(|slot| {
                let state = lock(&slot.state);
                BindingStatus {
                    binding: state.binding.clone(),
                    in_flight: state.in_flight,
                    last_used: state.last_used,
                    since_heartbeat_ms: state.last_heartbeat.elapsed().as_millis() as u64,
                    unhealthy_reason: state.unhealthy_reason.clone(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.binding.robot_id.cmp(&b.binding.robot_id));
        statuses
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
