//! Binding health monitor
//!
//! Runs a background task that flips bindings with missed heartbeats to
//! unhealthy so the router stops selecting them.

use crate::router::RobotRouter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

#[derive(Clone)]
pub struct HealthMonitor {
    router: Arc<RobotRouter>,
    check_interval: Duration,
    active: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(router: Arc<RobotRouter>, check_interval: Duration) -> Self {
        Self {
            router,
            check_interval,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One pass over the binding table; returns robots newly marked unhealthy
    pub fn check(&self) -> Vec<String> {
        self.router.sweep_stale()
    }

    /// Start the monitoring background task
    pub fn start(&self) -> Option<HealthMonitorHandle> {
        if self.active.swap(true, Ordering::SeqCst) {
            warn!("[HEALTH] Monitoring already active");
            return None;
        }

        let monitor = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(monitor.check_interval);
            loop {
                ticker.tick().await;
                if !monitor.active.load(Ordering::SeqCst) {
                    break;
                }
                let stale = monitor.check();
                if !stale.is_empty() {
                    warn!("[HEALTH] Lost heartbeat from {:?}", stale);
                }
            }
            info!("[HEALTH] Monitoring stopped");
        });

        Some(HealthMonitorHandle {
            active: self.active.clone(),
            task,
        })
    }
}

/// Handle to stop health monitoring
pub struct HealthMonitorHandle {
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl HealthMonitorHandle {
    pub fn stop(self) {
        self.active.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingSink;
    use crate::router::{ConnectionHandle, Health};
    use mcp_shared::TransportKind;

    fn router(window_ms: u64) -> Arc<RobotRouter> {
        let router = Arc::new(RobotRouter::new(
            Arc::new(TracingSink),
            1,
            Duration::from_millis(window_ms),
        ));
        router.register("quad-1", None, Vec::new(), TransportKind::Sim, ConnectionHandle(1));
        router
    }

    #[tokio::test]
    async fn test_check_marks_silent_robot() {
        let router = router(20);
        let monitor = HealthMonitor::new(router.clone(), Duration::from_millis(10));
        assert!(monitor.check().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(monitor.check(), vec!["quad-1".to_string()]);
        assert_eq!(router.binding("quad-1").unwrap().health, Health::Unhealthy);

        router.heartbeat("quad-1");
        assert!(router.binding("quad-1").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_start_is_exclusive() {
        let monitor = HealthMonitor::new(router(1000), Duration::from_millis(10));
        let handle = monitor.start().unwrap();
        assert!(monitor.start().is_none());
        handle.stop();
    }
}
