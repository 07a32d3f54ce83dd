pub mod session;
pub mod sim;
pub mod tcp;
pub mod traits;

use mcp_shared::TransportKind;
use std::collections::HashMap;
use std::sync::Arc;

pub use session::{RobotSession, SessionHandle};
pub use sim::{DeliveryRecord, SimAdapter, SimBehavior};
pub use tcp::TcpLinkAdapter;
pub use traits::{DeliveryEvent, DeliveryHandle, DeliveryResponder, TransportAdapter, TransportError};

/// Adapters keyed by the transport family they serve
#[derive(Default)]
pub struct TransportRegistry {
    adapters: HashMap<TransportKind, Arc<dyn TransportAdapter>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn TransportAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn TransportAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        self.adapters.keys().copied().collect()
    }
}
