//! Composition root
//!
//! Wires the validator, router, executor and transport adapters together
//! and exposes the caller-facing operations.

use crate::config::{ConfigError, McpConfig};
use crate::events::EventSink;
use crate::executor::ActionExecutor;
use crate::health::{HealthMonitor, HealthMonitorHandle};
use crate::plugins::PluginRegistry;
use crate::router::{BindingStatus, RobotRouter};
use crate::transport::{SimAdapter, SimBehavior, TcpLinkAdapter, TransportRegistry};
use crate::validator::{ActionCatalog, CommandValidator};
use mcp_shared::{CommandError, CommandOutcome, SubmitReceipt};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

pub struct McpContext {
    config: McpConfig,
    router: Arc<RobotRouter>,
    validator: CommandValidator,
    executor: Arc<ActionExecutor>,
    sim: Arc<SimAdapter>,
    tcp_link: Arc<TcpLinkAdapter>,
    health: HealthMonitor,
    health_handle: Mutex<Option<HealthMonitorHandle>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl McpContext {
    /// Context with the built-in action catalog and plugins
    pub fn new(config: McpConfig, sink: Arc<dyn EventSink>) -> Result<Self, ConfigError> {
        Self::with_registries(config, sink, ActionCatalog::builtin(), PluginRegistry::with_builtins())
    }

    pub fn with_registries(
        config: McpConfig,
        sink: Arc<dyn EventSink>,
        catalog: ActionCatalog,
        plugins: PluginRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let catalog = Arc::new(catalog);
        let plugins = Arc::new(plugins);
        let router = Arc::new(RobotRouter::new(
            sink.clone(),
            config.max_in_flight_per_robot,
            Duration::from_millis(config.heartbeat_timeout_ms),
        ));

        let sim = Arc::new(SimAdapter::new(router.clone()));
        let tcp_link = Arc::new(TcpLinkAdapter::new(router.clone()));
        let mut transports = TransportRegistry::new();
        transports.register(sim.clone());
        transports.register(tcp_link.clone());
        info!("[MCP] Transports: {:?}", transports.kinds());

        for robot in &config.simulated_robots {
            sim.add_robot(
                &robot.robot_id,
                robot.robot_type.clone(),
                robot.capabilities.clone(),
                SimBehavior::ack_after(robot.latency_ms),
            );
        }

        let validator = CommandValidator::new(
            catalog.clone(),
            plugins.clone(),
            sink.clone(),
            config.min_timeout_ms,
            config.max_timeout_ms,
        );
        let executor = ActionExecutor::new(
            config.clone(),
            router.clone(),
            plugins,
            catalog,
            Arc::new(transports),
            sink,
        );
        let health = HealthMonitor::new(
            router.clone(),
            Duration::from_millis(config.health_check_interval_ms),
        );

        Ok(Self {
            config,
            router,
            validator,
            executor,
            sim,
            tcp_link,
            health,
            health_handle: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start workers, the sweeper, health monitoring and simulated heartbeats
    pub fn start(&self) {
        self.executor.start();

        let mut health = self.health_handle.lock().unwrap_or_else(PoisonError::into_inner);
        if health.is_none() {
            *health = self.health.start();
        }

        // Well inside the missed-heartbeat window
        let period = Duration::from_millis((self.config.heartbeat_timeout_ms / 3).max(1));
        let sim = self.sim.clone();
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tokio::spawn(sim.run_heartbeats(period)));
        info!("[MCP] Started");
    }

    /// Validate and admit a raw intake request
    pub async fn submit(&self, raw: &Value) -> Result<SubmitReceipt, CommandError> {
        let validated = self.validator.validate(raw)?;
        Ok(self.executor.submit(validated).await?)
    }

    pub async fn cancel(&self, command_id: &str, reason: &str) -> Option<CommandOutcome> {
        self.executor.cancel(command_id, reason).await
    }

    pub async fn status(&self, command_id: &str) -> Option<CommandOutcome> {
        self.executor.status(command_id).await
    }

    /// Wait for a terminal outcome, returning the current one if `bound` elapses
    pub async fn wait(&self, command_id: &str, bound: Duration) -> Option<CommandOutcome> {
        self.executor.wait(command_id, bound).await
    }

    /// Add an in-process robot with a scripted behavior
    pub fn add_sim_robot(
        &self,
        robot_id: &str,
        robot_type: Option<&str>,
        capabilities: &[&str],
        behavior: SimBehavior,
    ) {
        self.sim.add_robot(
            robot_id,
            robot_type.map(str::to_string),
            capabilities.iter().map(|c| c.to_string()).collect(),
            behavior,
        );
    }

    pub fn bindings(&self) -> Vec<BindingStatus> {
        self.router.snapshot()
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<RobotRouter> {
        &self.router
    }

    pub fn sim(&self) -> &Arc<SimAdapter> {
        &self.sim
    }

    pub fn tcp_link(&self) -> &Arc<TcpLinkAdapter> {
        &self.tcp_link
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    /// Cancel outstanding work and stop every background task
    pub async fn shutdown(&self) {
        info!("[MCP] Shutting down");
        self.executor.shutdown().await;

        if let Some(handle) = self
            .health_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.stop();
        }
        for task in self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}
