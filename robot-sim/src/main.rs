mod link;

use link::LinkConfig;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let defaults = LinkConfig::default();
    let mut args = std::env::args().skip(1);
    let robot_id = args.next().unwrap_or(defaults.robot_id.clone());
    let server = args.next().unwrap_or(defaults.server.clone());

    let capabilities = env_list("ROBOT_CAPABILITIES");
    let config = LinkConfig {
        robot_id,
        server,
        robot_type: std::env::var("ROBOT_TYPE").ok().or(defaults.robot_type.clone()),
        capabilities: if capabilities.is_empty() {
            defaults.capabilities.clone()
        } else {
            capabilities
        },
        latency: std::env::var("ROBOT_LATENCY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.latency),
        faulty_actions: env_list("ROBOT_FAULTY_ACTIONS").into_iter().collect(),
        ..defaults
    };

    info!("Simulated robot starting: {}", config.robot_id);
    info!("  server:       {}", config.server);
    info!("  type:         {:?}", config.robot_type);
    info!("  capabilities: {:?}", config.capabilities);

    link::run(config).await;
}
