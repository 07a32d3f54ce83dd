//! Priority dispatch queue
//!
//! One lane per robot. Within a lane entries leave by priority, then by
//! enqueue sequence. A lane with a raised barrier (an emergency command in
//! progress for that robot) yields nothing until the barrier drops.

use crate::router::RobotRouter;
use mcp_shared::Priority;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub priority: Priority,
    pub seq: u64,
    pub command_id: String,
    pub robot_id: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One unit of a robot's concurrency budget, returned exactly once
pub struct InFlightSlot {
    robot_id: String,
    released: AtomicBool,
    router: Arc<RobotRouter>,
    wake: Arc<Notify>,
}

impl InFlightSlot {
    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn release(&self) {
        if !self.released.swap(true, AtomicOrdering::SeqCst) {
            self.router.release(&self.robot_id);
            self.wake.notify_waiters();
        }
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for InFlightSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightSlot")
            .field("robot_id", &self.robot_id)
            .field("released", &self.released.load(AtomicOrdering::SeqCst))
            .finish()
    }
}

#[derive(Default)]
struct Lane {
    heap: BinaryHeap<QueueEntry>,
    barrier: u32,
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<String, Lane>,
    closed: bool,
}

pub struct DispatchQueue {
    state: Mutex<QueueState>,
    wake: Arc<Notify>,
    seq: AtomicU64,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Arc::new(Notify::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a command on a robot's lane; false once closed
    pub fn push(&self, robot_id: &str, priority: Priority, command_id: &str) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            state
                .lanes
                .entry(robot_id.to_string())
                .or_default()
                .heap
                .push(QueueEntry {
                    priority,
                    seq,
                    command_id: command_id.to_string(),
                    robot_id: robot_id.to_string(),
                });
        }
        self.wake.notify_waiters();
        true
    }

    /// Drop a command from whichever lane holds it
    pub fn remove(&self, command_id: &str) -> bool {
        let mut state = self.lock();
        let mut removed = false;
        for lane in state.lanes.values_mut() {
            let before = lane.heap.len();
            lane.heap.retain(|e| e.command_id != command_id);
            removed |= lane.heap.len() != before;
        }
        removed
    }

    pub fn raise_barrier(&self, robot_id: &str) {
        self.lock()
            .lanes
            .entry(robot_id.to_string())
            .or_default()
            .barrier += 1;
    }

    pub fn lower_barrier(&self, robot_id: &str) {
        {
            let mut state = self.lock();
            if let Some(lane) = state.lanes.get_mut(robot_id) {
                lane.barrier = lane.barrier.saturating_sub(1);
            }
        }
        self.wake.notify_waiters();
    }

    pub fn is_blocked(&self, robot_id: &str) -> bool {
        self.lock()
            .lanes
            .get(robot_id)
            .map(|lane| lane.barrier > 0)
            .unwrap_or(false)
    }

    /// Take an in-flight slot for a robot outside the queue
    pub fn slot(&self, router: &Arc<RobotRouter>, robot_id: &str) -> Option<Arc<InFlightSlot>> {
        router.try_acquire(robot_id).then(|| {
            Arc::new(InFlightSlot {
                robot_id: robot_id.to_string(),
                released: AtomicBool::new(false),
                router: router.clone(),
                wake: self.wake.clone(),
            })
        })
    }

    /// Pop the best entry whose robot has capacity and no barrier
    fn try_pop(&self, router: &Arc<RobotRouter>) -> Option<(QueueEntry, Arc<InFlightSlot>)> {
        let mut state = self.lock();

        let mut heads: Vec<(QueueEntry, String)> = state
            .lanes
            .iter()
            .filter(|(_, lane)| lane.barrier == 0)
            .filter_map(|(robot_id, lane)| lane.heap.peek().map(|e| (e.clone(), robot_id.clone())))
            .collect();
        heads.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, robot_id) in heads {
            if let Some(slot) = self.slot(router, &robot_id) {
                let entry = state.lanes.get_mut(&robot_id)?.heap.pop()?;
                return Some((entry, slot));
            }
        }
        None
    }

    /// Wait for the next dispatchable entry; `None` once closed
    pub async fn next(&self, router: &Arc<RobotRouter>) -> Option<(QueueEntry, Arc<InFlightSlot>)> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(next) = self.try_pop(router) {
                return Some(next);
            }
            notified.await;
        }
    }

    /// Stop handing out entries and return whatever was still queued
    pub fn close(&self) -> Vec<QueueEntry> {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            state
                .lanes
                .values_mut()
                .flat_map(|lane| std::mem::take(&mut lane.heap).into_vec())
                .collect()
        };
        self.wake.notify_waiters();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().lanes.values().map(|lane| lane.heap.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingSink;
    use crate::router::ConnectionHandle;
    use mcp_shared::TransportKind;
    use std::time::Duration;

    fn router_with(robots: &[&str]) -> Arc<RobotRouter> {
        let router = Arc::new(RobotRouter::new(Arc::new(TracingSink), 1, Duration::from_secs(5)));
        for robot in robots {
            router.register(robot, None, Vec::new(), TransportKind::Sim, ConnectionHandle(0));
        }
        router
    }

    #[test]
    fn test_priority_then_fifo() {
        let router = router_with(&["r1"]);
        let queue = DispatchQueue::new();
        queue.push("r1", Priority::Low, "a");
        queue.push("r1", Priority::Normal, "b");
        queue.push("r1", Priority::High, "c");
        queue.push("r1", Priority::Normal, "d");

        let mut order = Vec::new();
        while let Some((entry, slot)) = queue.try_pop(&router) {
            order.push(entry.command_id);
            slot.release();
        }
        assert_eq!(order, ["c", "b", "d", "a"]);
    }

    #[test]
    fn test_busy_robot_is_skipped() {
        let router = router_with(&["r1", "r2"]);
        let queue = DispatchQueue::new();
        queue.push("r1", Priority::High, "a");
        queue.push("r1", Priority::High, "b");
        queue.push("r2", Priority::Low, "c");

        let (first, _held) = queue.try_pop(&router).unwrap();
        assert_eq!(first.command_id, "a");
        // r1 is at its limit, so r2's entry goes next despite lower priority
        let (second, _held2) = queue.try_pop(&router).unwrap();
        assert_eq!(second.command_id, "c");
        assert!(queue.try_pop(&router).is_none());
    }

    #[test]
    fn test_barrier_blocks_lane() {
        let router = router_with(&["r1"]);
        let queue = DispatchQueue::new();
        queue.push("r1", Priority::Normal, "a");
        queue.raise_barrier("r1");
        assert!(queue.is_blocked("r1"));
        assert!(queue.try_pop(&router).is_none());
        queue.lower_barrier("r1");
        assert_eq!(queue.try_pop(&router).unwrap().0.command_id, "a");
    }

    #[test]
    fn test_slot_released_once() {
        let router = router_with(&["r1"]);
        let queue = DispatchQueue::new();
        let slot = queue.slot(&router, "r1").unwrap();
        assert!(queue.slot(&router, "r1").is_none());
        slot.release();
        slot.release();
        assert_eq!(router.in_flight("r1"), 0);
        drop(slot);
        assert_eq!(router.in_flight("r1"), 0);
    }

    #[test]
    fn test_remove_and_close() {
        let queue = DispatchQueue::new();
        queue.push("r1", Priority::Normal, "a");
        queue.push("r2", Priority::Normal, "b");
        assert!(queue.remove("a"));
        assert!(!queue.remove("a"));
        let drained = queue.close();
        assert_eq!(drained.len(), 1);
        assert!(!queue.push("r1", Priority::Normal, "c"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let router = router_with(&["r1"]);
        let queue = Arc::new(DispatchQueue::new());
        let waiter = {
            let queue = queue.clone();
            let router = router.clone();
            tokio::spawn(async move { queue.next(&router).await.map(|(e, _)| e.command_id) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("r1", Priority::Normal, "late");
        assert_eq!(waiter.await.unwrap().as_deref(), Some("late"));
    }
}
