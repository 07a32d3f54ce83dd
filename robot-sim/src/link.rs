//! Persistent robot link with automatic reconnection

use anyhow::{anyhow, Result};
use mcp_shared::codec::{self, FrameDecoder};
use mcp_shared::{defaults, ErrorKind, LinkFrame, PrimitiveCommand};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, info, warn};

/// Configuration for a simulated robot
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub robot_id: String,
    pub robot_type: Option<String>,
    pub capabilities: Vec<String>,
    /// Robot link address of the mediation layer
    pub server: String,
    /// Time spent "executing" each primitive
    pub latency: Duration,
    /// Actions answered with a hardware fault
    pub faulty_actions: HashSet<String>,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            robot_id: "sim-001".into(),
            robot_type: Some("rover".into()),
            capabilities: vec!["drive".into()],
            server: "127.0.0.1:7401".into(),
            latency: Duration::from_millis(200),
            faulty_actions: HashSet::new(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Connect, serve, and reconnect with exponential backoff, forever
pub async fn run(config: LinkConfig) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match timeout(config.connect_timeout, TcpStream::connect(&config.server)).await {
            Ok(Ok(stream)) => {
                info!("Connected to {}", config.server);
                reconnect_delay = config.reconnect_delay;
                if let Err(reason) = handle_connection(stream, &config).await {
                    warn!("Disconnected: {}", reason);
                }
            }
            Ok(Err(e)) => warn!("Connect to {} failed: {}", config.server, e),
            Err(_) => warn!("Connect to {} timed out", config.server),
        }

        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

/// What the robot does with one primitive
fn execute(config: &LinkConfig, command: &PrimitiveCommand) -> (Duration, Option<String>) {
    if config.faulty_actions.contains(&command.action) {
        return (
            config.latency / 2,
            Some(format!("{} failed on {}", command.action, config.robot_id)),
        );
    }
    (config.latency, None)
}

async fn handle_connection(stream: TcpStream, config: &LinkConfig) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    let register = LinkFrame::Register {
        robot_id: config.robot_id.clone(),
        robot_type: config.robot_type.clone(),
        capabilities: config.capabilities.clone(),
    };
    writer.write_all(&codec::encode(&register)?).await?;

    // Completions from execution tasks
    let (done_tx, mut done_rx) = mpsc::channel::<LinkFrame>(32);
    let mut running: HashMap<u64, JoinHandle<()>> = HashMap::new();

    let mut heartbeat_interval = interval(Duration::from_millis(defaults::HEARTBEAT_INTERVAL_MS));
    let start_time = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                let frame = LinkFrame::Heartbeat {
                    robot_id: config.robot_id.clone(),
                    uptime_ms: start_time.elapsed().as_millis() as u64,
                    healthy: true,
                };
                writer.write_all(&codec::encode(&frame)?).await?;
            }

            Some(frame) = done_rx.recv() => {
                if let LinkFrame::Ack { delivery_id, .. } | LinkFrame::Fault { delivery_id, .. } = &frame {
                    running.remove(delivery_id);
                }
                writer.write_all(&codec::encode(&frame)?).await?;
            }

            result = reader.read(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    return Err(anyhow!("Server closed connection"));
                }
                decoder.extend(&read_buf[..n]);

                while let Some(frame) = decoder.decode_next::<LinkFrame>()? {
                    match frame {
                        LinkFrame::Registered { robot_id } => info!("Registered as {}", robot_id),
                        LinkFrame::Deliver { delivery_id, command } => {
                            info!("#{} {} {:?}", delivery_id, command.action, command.params);
                            let (latency, fault) = execute(config, &command);
                            let done_tx = done_tx.clone();
                            let task = tokio::spawn(async move {
                                tokio::time::sleep(latency).await;
                                let frame = match fault {
                                    Some(message) => LinkFrame::Fault {
                                        delivery_id,
                                        kind: ErrorKind::HardwareFault,
                                        message,
                                    },
                                    None => LinkFrame::Ack {
                                        delivery_id,
                                        payload: json!({ "action": command.action }),
                                    },
                                };
                                let _ = done_tx.send(frame).await;
                            });
                            running.insert(delivery_id, task);
                        }
                        LinkFrame::Abort { delivery_id } => {
                            if let Some(task) = running.remove(&delivery_id) {
                                task.abort();
                                info!("#{} aborted", delivery_id);
                            }
                        }
                        other => debug!("Ignoring {:?}", other),
                    }
                }
            }
        }
    }
}
