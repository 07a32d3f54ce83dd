//! TCP robot link
//!
//! Robots dial in, register, and then exchange length-prefixed link frames.
//! Each delivery is tracked by id until the robot acks or faults it, or the
//! session drops.

use super::session::{RobotSession, SessionHandle};
use super::{DeliveryEvent, DeliveryHandle, TransportAdapter, TransportError};
use crate::router::{ConnectionHandle, RobotBinding, RobotRouter};
use async_trait::async_trait;
use mcp_shared::{LinkFrame, PrimitiveCommand, TransportKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

/// How long a fresh connection has to send its registration
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

struct PendingDelivery {
    session_id: u64,
    events: oneshot::Sender<DeliveryEvent>,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingDelivery>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, PendingDelivery>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TcpLinkAdapter {
    router: Arc<RobotRouter>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    pending: PendingMap,
    next_session: AtomicU64,
    next_delivery: AtomicU64,
}

impl TcpLinkAdapter {
    pub fn new(router: Arc<RobotRouter>) -> Self {
        Self {
            router,
            sessions: RwLock::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_session: AtomicU64::new(1),
            next_delivery: AtomicU64::new(1),
        }
    }

    /// Accept robot connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("[LINK] Robot link listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
            debug!("[LINK] Connection #{} from {}", session_id, addr);

            let adapter = self.clone();
            tokio::spawn(async move {
                adapter
                    .handle_session(RobotSession::new(stream, addr, session_id))
                    .await;
            });
        }
    }

    async fn handle_session(&self, mut session: RobotSession) {
        let addr = session.addr();
        let session_id = session.session_id();

        let first = tokio::time::timeout(REGISTER_TIMEOUT, session.recv()).await;
        let (robot_id, robot_type, capabilities) = match first {
            Ok(Some(LinkFrame::Register {
                robot_id,
                robot_type,
                capabilities,
            })) if !robot_id.is_empty() => (robot_id, robot_type, capabilities),
            Ok(Some(other)) => {
                warn!("[LINK] {} sent {:?} before registering, closing", addr, other);
                return;
            }
            Ok(None) => return,
            Err(_) => {
                warn!("[LINK] {} did not register in time, closing", addr);
                return;
            }
        };

        let handle = session.handle(&robot_id);
        if let Some(previous) = self
            .sessions
            .write()
            .await
            .insert(robot_id.clone(), handle.clone())
        {
            info!(
                "[LINK] {} reconnected (session #{} replaces #{})",
                robot_id, session_id, previous.session_id
            );
        }
        self.router.register(
            &robot_id,
            robot_type,
            capabilities,
            TransportKind::Tcp,
            ConnectionHandle(session_id),
        );
        if let Err(e) = handle
            .send(&LinkFrame::Registered {
                robot_id: robot_id.clone(),
            })
            .await
        {
            warn!("[LINK] Failed to confirm registration of {}: {}", robot_id, e);
        }

        while let Some(frame) = session.recv().await {
            match frame {
                LinkFrame::Heartbeat { healthy: true, .. } => {
                    self.router.heartbeat(&robot_id);
                }
                LinkFrame::Heartbeat { healthy: false, .. } => {
                    self.router.mark_unhealthy(&robot_id, "robot reported unhealthy");
                }
                LinkFrame::Ack {
                    delivery_id,
                    payload,
                } => self.complete(session_id, delivery_id, DeliveryEvent::Ack { payload }),
                LinkFrame::Fault {
                    delivery_id,
                    kind,
                    message,
                } => self.complete(session_id, delivery_id, DeliveryEvent::Fault { kind, message }),
                other => {
                    debug!("[LINK] Ignoring {:?} from {}", other, robot_id);
                }
            }
        }

        info!("[LINK] {} disconnected (session #{})", robot_id, session_id);
        self.close_session(&robot_id, session_id).await;
    }

    fn complete(&self, session_id: u64, delivery_id: u64, event: DeliveryEvent) {
        let mut pending = lock(&self.pending);
        match pending.get(&delivery_id) {
            Some(entry) if entry.session_id == session_id => {
                if let Some(entry) = pending.remove(&delivery_id) {
                    let _ = entry.events.send(event);
                }
            }
            Some(_) => warn!("[LINK] Delivery #{} answered by the wrong session", delivery_id),
            None => debug!("[LINK] Late answer for delivery #{}", delivery_id),
        }
    }

    async fn close_session(&self, robot_id: &str, session_id: u64) {
        let orphaned: Vec<PendingDelivery> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for entry in orphaned {
            let _ = entry.events.send(DeliveryEvent::Disconnected {
                reason: format!("link to {} closed", robot_id),
            });
        }

        let mut sessions = self.sessions.write().await;
        if sessions.get(robot_id).map(|h| h.session_id) == Some(session_id) {
            sessions.remove(robot_id);
        }
        drop(sessions);

        let current = self.router.binding(robot_id).map(|b| b.connection);
        if current == Some(ConnectionHandle(session_id)) {
            self.router.mark_unhealthy(robot_id, "connection closed");
        }
    }

    /// Robots with an open link
    pub async fn connected(&self) -> Vec<String> {
        let mut robots: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        robots.sort();
        robots
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

#[async_trait]
impl TransportAdapter for TcpLinkAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn deliver(
        &self,
        binding: &RobotBinding,
        command: &PrimitiveCommand,
    ) -> Result<DeliveryHandle, TransportError> {
        let session = self
            .sessions
            .read()
            .await
            .get(&binding.robot_id)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(binding.robot_id.clone()))?;

        let delivery_id = self.next_delivery.fetch_add(1, Ordering::Relaxed);
        let (handle, responder) = DeliveryHandle::new(delivery_id);
        let (events, abort) = responder.into_parts();
        lock(&self.pending).insert(
            delivery_id,
            PendingDelivery {
                session_id: session.session_id,
                events,
            },
        );

        let frame = LinkFrame::Deliver {
            delivery_id,
            command: command.clone(),
        };
        if let Err(e) = session.send(&frame).await {
            lock(&self.pending).remove(&delivery_id);
            return Err(e);
        }

        let pending = self.pending.clone();
        tokio::spawn(async move {
            // Err means the handle was dropped without aborting
            if abort.await.is_err() {
                return;
            }
            let still_pending = lock(&pending).remove(&delivery_id).is_some();
            if still_pending {
                if let Err(e) = session.send(&LinkFrame::Abort { delivery_id }).await {
                    debug!("[LINK] Abort #{} not sent: {}", delivery_id, e);
                }
            }
        });

        Ok(handle)
    }
}
