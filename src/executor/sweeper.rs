//! Deadline and retention sweeping for execution records

use super::ActionExecutor;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

/// Times out queued records past their budget and evicts old terminal ones
pub struct Sweeper {
    executor: Arc<ActionExecutor>,
    check_interval: Duration,
}

impl Sweeper {
    pub fn new(executor: Arc<ActionExecutor>, check_interval: Duration) -> Self {
        Self {
            executor,
            check_interval,
        }
    }

    /// Run until the executor's queue closes
    pub async fn run(&self) {
        let mut ticker = interval(self.check_interval);

        loop {
            ticker.tick().await;
            if self.executor.queue.is_closed() {
                break;
            }
            self.sweep().await;
        }
        debug!("[SWEEP] Stopped");
    }

    pub async fn sweep(&self) {
        let executor = &self.executor;

        for id in executor.records.queued_past_deadline(Instant::now()).await {
            let Some(cmd) = executor.records.command(&id).await else {
                continue;
            };
            if executor.expire(&id, &cmd.command).await {
                executor.queue.remove(&id);
                info!("[SWEEP] {} timed out while queued", id);
            }
        }

        let evicted = executor
            .records
            .evict_terminal_older_than(executor.config.retention())
            .await;
        if !evicted.is_empty() {
            debug!("[SWEEP] Evicted {} terminal records", evicted.len());
        }
    }
}
