//! Individual robot link session handling

use mcp_shared::codec::{self, FrameDecoder};
use mcp_shared::LinkFrame;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use super::TransportError;

/// Handle to send frames to a specific robot
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: u64,
    pub robot_id: String,
    pub addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pub connected_at: Instant,
}

impl SessionHandle {
    /// Send a frame to this robot
    pub async fn send(&self, frame: &LinkFrame) -> Result<(), TransportError> {
        let encoded = codec::encode(frame)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&encoded)
            .await
            .map_err(|e| TransportError::Send {
                robot_id: self.robot_id.clone(),
                reason: e.to_string(),
            })
    }
}

/// Active robot session
pub struct RobotSession {
    session_id: u64,
    addr: SocketAddr,
    reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    connected_at: Instant,
}

impl RobotSession {
    pub fn new(stream: TcpStream, addr: SocketAddr, session_id: u64) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            session_id,
            addr,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
            connected_at: Instant::now(),
        }
    }

    /// Cloneable send handle, once the robot has named itself
    pub fn handle(&self, robot_id: &str) -> SessionHandle {
        SessionHandle {
            session_id: self.session_id,
            robot_id: robot_id.to_string(),
            addr: self.addr,
            writer: self.writer.clone(),
            connected_at: self.connected_at,
        }
    }

    /// Read the next frame from this session
    /// Returns None if the connection is closed or the stream is corrupt
    pub async fn recv(&mut self) -> Option<LinkFrame> {
        loop {
            match self.decoder.decode_next::<LinkFrame>() {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(e) => {
                    warn!("[LINK] Decode error from {}: {}", self.addr, e);
                    return None;
                }
            }

            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None,
                Ok(n) => self.decoder.extend(&self.read_buf[..n]),
                Err(e) => {
                    warn!("[LINK] Read error from {}: {}", self.addr, e);
                    return None;
                }
            }
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}
