//! Robot routing
//!
//! Resolves a command target to a live binding. Resolution is a pure lookup
//! over the binding table; it never waits.

mod table;

use crate::events::{EventKind, EventSink, LifecycleEvent};
use mcp_shared::{CommandError, ErrorKind, Priority, Target, TransportKind};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub use table::{BindingStatus, BindingTable, ConnectionHandle, Health, RobotBinding};

/// Trace id used for events not tied to a caller request
const SYSTEM_TRACE: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("no healthy robot matches {0}")]
    RobotOffline(String),

    #[error("robot {0} is at its concurrency limit")]
    RobotBusy(String),
}

impl RoutingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoutingError::RobotOffline(_) => ErrorKind::RobotOffline,
            RoutingError::RobotBusy(_) => ErrorKind::RobotBusy,
        }
    }
}

impl From<RoutingError> for CommandError {
    fn from(err: RoutingError) -> Self {
        CommandError::new(err.kind(), err.to_string())
    }
}

pub struct RobotRouter {
    table: BindingTable,
    sink: Arc<dyn EventSink>,
    max_in_flight: usize,
    heartbeat_timeout: Duration,
}

impl RobotRouter {
    pub fn new(sink: Arc<dyn EventSink>, max_in_flight: usize, heartbeat_timeout: Duration) -> Self {
        Self {
            table: BindingTable::new(),
            sink,
            max_in_flight,
            heartbeat_timeout,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Register (or re-register) a robot
    pub fn register(
        &self,
        robot_id: &str,
        robot_type: Option<String>,
        capabilities: impl IntoIterator<Item = String>,
        transport: TransportKind,
        connection: ConnectionHandle,
    ) {
        let capabilities: BTreeSet<String> = capabilities.into_iter().collect();
        info!(
            "[ROUTER] Register {} via {} caps={:?}",
            robot_id, transport, capabilities
        );
        self.table.upsert(RobotBinding {
            robot_id: robot_id.to_string(),
            robot_type,
            transport,
            connection,
            capabilities,
            health: Health::Healthy,
        });
        self.sink.emit(LifecycleEvent::new(
            SYSTEM_TRACE,
            robot_id,
            EventKind::BindingRegistered {
                robot_id: robot_id.to_string(),
            },
        ));
    }

    pub fn heartbeat(&self, robot_id: &str) -> bool {
        self.table.heartbeat(robot_id)
    }

    /// Exclude a binding from routing until it re-registers or heartbeats
    pub fn mark_unhealthy(&self, robot_id: &str, reason: &str) {
        if self.table.mark_unhealthy(robot_id, reason) {
            warn!("[ROUTER] {} unhealthy: {}", robot_id, reason);
            self.sink.emit(LifecycleEvent::new(
                SYSTEM_TRACE,
                robot_id,
                EventKind::BindingUnhealthy {
                    robot_id: robot_id.to_string(),
                    reason: reason.to_string(),
                },
            ));
        }
    }

    /// Flip bindings with missed heartbeats to unhealthy
    pub fn sweep_stale(&self) -> Vec<String> {
        let stale = self.table.mark_stale(self.heartbeat_timeout);
        for robot_id in &stale {
            warn!("[ROUTER] {} missed heartbeats", robot_id);
            self.sink.emit(LifecycleEvent::new(
                SYSTEM_TRACE,
                robot_id.as_str(),
                EventKind::BindingUnhealthy {
                    robot_id: robot_id.clone(),
                    reason: "heartbeat timeout".into(),
                },
            ));
        }
        stale
    }

    /// Resolve a target to one binding
    ///
    /// Exact ids are looked up directly. Queries pick the least loaded
    /// healthy match, breaking ties by least-recently-used. EMERGENCY
    /// priority ignores the concurrency limit.
    pub fn resolve(&self, target: &Target, priority: Priority) -> Result<RobotBinding, RoutingError> {
        let emergency = priority == Priority::Emergency;

        let binding = match target {
            Target::Robot { robot_id } => {
                let binding = self
                    .table
                    .get(robot_id)
                    .filter(RobotBinding::is_healthy)
                    .ok_or_else(|| RoutingError::RobotOffline(target.to_string()))?;
                if !emergency && self.table.in_flight(robot_id) >= self.max_in_flight {
                    return Err(RoutingError::RobotBusy(robot_id.clone()));
                }
                binding
            }
            Target::Query {
                robot_type,
                capabilities,
            } => {
                let mut candidates = self.table.select(|b| {
                    b.is_healthy() && b.matches(robot_type.as_deref(), capabilities)
                });
                if candidates.is_empty() {
                    return Err(RoutingError::RobotOffline(target.to_string()));
                }
                if !emergency {
                    candidates.retain(|(_, in_flight, _)| *in_flight < self.max_in_flight);
                    if candidates.is_empty() {
                        return Err(RoutingError::RobotBusy(target.to_string()));
                    }
                }
                candidates
                    .into_iter()
                    .min_by(|a, b| {
                        a.1.cmp(&b.1)
                            .then(a.2.cmp(&b.2))
                            .then_with(|| a.0.robot_id.cmp(&b.0.robot_id))
                    })
                    .map(|(binding, _, _)| binding)
                    .ok_or_else(|| RoutingError::RobotOffline(target.to_string()))?
            }
            Target::All => return Err(RoutingError::RobotOffline(target.to_string())),
        };

        self.table.touch(&binding.robot_id);
        Ok(binding)
    }

    /// Every binding matching a target, healthy or not
    pub fn resolve_all(&self, target: &Target) -> Vec<RobotBinding> {
        let mut bindings: Vec<RobotBinding> = match target {
            Target::Robot { robot_id } => self.table.get(robot_id).into_iter().collect(),
            Target::Query {
                robot_type,
                capabilities,
            } => self
                .table
                .select(|b| b.matches(robot_type.as_deref(), capabilities))
                .into_iter()
                .map(|(b, _, _)| b)
                .collect(),
            Target::All => self.table.select(|_| true).into_iter().map(|(b, _, _)| b).collect(),
        };
        bindings.sort_by(|a, b| a.robot_id.cmp(&b.robot_id));
        bindings
    }

    pub fn binding(&self, robot_id: &str) -> Option<RobotBinding> {
        self.table.get(robot_id)
    }

    pub fn in_flight(&self, robot_id: &str) -> usize {
        self.table.in_flight(robot_id)
    }

    pub fn try_acquire(&self, robot_id: &str) -> bool {
        self.table.try_acquire(robot_id, self.max_in_flight)
    }

    pub fn release(&self, robot_id: &str) {
        self.table.release(robot_id)
    }

    pub fn snapshot(&self) -> Vec<BindingStatus> {
        self.table.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingSink;

    fn router() -> RobotRouter {
        RobotRouter::new(Arc::new(TracingSink), 1, Duration::from_secs(5))
    }

    fn register(router: &RobotRouter, robot_id: &str, robot_type: &str, caps: &[&str]) {
        router.register(
            robot_id,
            Some(robot_type.into()),
            caps.iter().map(|c| c.to_string()),
            TransportKind::Sim,
            ConnectionHandle(0),
        );
    }

    fn camera_query() -> Target {
        Target::Query {
            robot_type: Some("quad".into()),
            capabilities: vec!["camera".into()],
        }
    }

    #[test]
    fn test_exact_match() {
        let router = router();
        register(&router, "quad-1", "quad", &["camera"]);
        let b = router.resolve(&Target::robot("quad-1"), Priority::Normal).unwrap();
        assert_eq!(b.robot_id, "quad-1");
    }

    #[test]
    fn test_unregistered_robot_is_offline() {
        let router = router();
        let err = router.resolve(&Target::robot("ghost"), Priority::Normal).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RobotOffline);
    }

    #[test]
    fn test_unhealthy_excluded() {
        let router = router();
        register(&router, "quad-1", "quad", &["camera"]);
        router.mark_unhealthy("quad-1", "connection lost");
        assert!(matches!(
            router.resolve(&Target::robot("quad-1"), Priority::Normal),
            Err(RoutingError::RobotOffline(_))
        ));
        assert!(matches!(
            router.resolve(&camera_query(), Priority::Normal),
            Err(RoutingError::RobotOffline(_))
        ));
    }

    #[test]
    fn test_query_spreads_by_lru() {
        let router = router();
        register(&router, "quad-a", "quad", &["camera"]);
        register(&router, "quad-b", "quad", &["camera", "lidar"]);
        register(&router, "arm-1", "arm", &["camera"]);

        let first = router.resolve(&camera_query(), Priority::Normal).unwrap();
        let second = router.resolve(&camera_query(), Priority::Normal).unwrap();
        let third = router.resolve(&camera_query(), Priority::Normal).unwrap();
        assert_ne!(first.robot_id, second.robot_id);
        assert_eq!(first.robot_id, third.robot_id);
        assert!(first.robot_id.starts_with("quad"));
        assert!(second.robot_id.starts_with("quad"));
    }

    #[test]
    fn test_busy_unless_emergency() {
        let router = router();
        register(&router, "quad-1", "quad", &["camera"]);
        assert!(router.try_acquire("quad-1"));

        assert!(matches!(
            router.resolve(&Target::robot("quad-1"), Priority::High),
            Err(RoutingError::RobotBusy(_))
        ));
        assert!(matches!(
            router.resolve(&camera_query(), Priority::Normal),
            Err(RoutingError::RobotBusy(_))
        ));
        assert!(router.resolve(&Target::robot("quad-1"), Priority::Emergency).is_ok());
    }

    #[test]
    fn test_query_prefers_idle_robot() {
        let router = router();
        register(&router, "quad-a", "quad", &["camera"]);
        register(&router, "quad-b", "quad", &["camera"]);
        assert!(router.try_acquire("quad-a"));
        let b = router.resolve(&camera_query(), Priority::Normal).unwrap();
        assert_eq!(b.robot_id, "quad-b");
    }

    #[test]
    fn test_resolve_all_includes_unhealthy() {
        let router = router();
        register(&router, "quad-a", "quad", &["camera"]);
        register(&router, "arm-1", "arm", &[]);
        router.mark_unhealthy("arm-1", "heartbeat timeout");
        let all: Vec<_> = router
            .resolve_all(&Target::All)
            .into_iter()
            .map(|b| b.robot_id)
            .collect();
        assert_eq!(all, vec!["arm-1".to_string(), "quad-a".to_string()]);
    }
}
