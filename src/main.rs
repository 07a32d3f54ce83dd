use robot_mcp::events::TracingSink;
use robot_mcp::{IntakeServer, McpConfig, McpContext};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MCP_CONFIG").ok())
        .unwrap_or_else(|| "robot-mcp.toml".into());
    let config = McpConfig::load(&config_path)?;

    info!("Robot MCP starting (config: {})", config_path);
    info!("  intake:     {}", config.intake_addr);
    info!("  robot link: {}", config.robot_link_addr);
    info!("  workers:    {}", config.workers);
    if !config.simulated_robots.is_empty() {
        info!("  simulated:  {} robots", config.simulated_robots.len());
    }

    let intake_listener = TcpListener::bind(&config.intake_addr).await?;
    let link_listener = TcpListener::bind(&config.robot_link_addr).await?;

    let context = Arc::new(McpContext::new(config, Arc::new(TracingSink))?);
    context.start();

    let link = context.tcp_link().clone();
    let link_task = tokio::spawn(async move {
        if let Err(e) = link.serve(link_listener).await {
            error!("Robot link stopped: {}", e);
        }
    });

    let intake = Arc::new(IntakeServer::new(context.clone()));
    let intake_task = tokio::spawn(async move {
        if let Err(e) = intake.serve(intake_listener).await {
            error!("Intake stopped: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    intake_task.abort();
    context.shutdown().await;
    link_task.abort();

    info!("Robot MCP stopped");
    Ok(())
}
