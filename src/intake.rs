//! Caller intake server
//!
//! Callers connect over TCP and exchange length-prefixed JSON frames: one
//! reply per request, in order.

use crate::context::McpContext;
use mcp_shared::codec::{self, FrameDecoder};
use mcp_shared::{IntakeFrame, IntakeReply};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct IntakeServer {
    context: Arc<McpContext>,
}

impl IntakeServer {
    pub fn new(context: Arc<McpContext>) -> Self {
        Self { context }
    }

    /// Accept callers until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("[INTAKE] Listening on {}", listener.local_addr()?);
        loop {
            let (socket, addr) = listener.accept().await?;
            debug!("[INTAKE] Caller connected: {}", addr);

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_caller(socket, addr).await {
                    warn!("[INTAKE] Caller {} dropped: {}", addr, e);
                }
            });
        }
    }

    async fn handle_caller(&self, mut socket: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 4096];

        loop {
            while let Some(frame) = decoder.decode_next::<IntakeFrame>()? {
                let reply = self.handle(frame).await;
                socket.write_all(&codec::encode(&reply)?).await?;
            }

            match socket.read(&mut buf).await? {
                0 => {
                    debug!("[INTAKE] Caller disconnected: {}", addr);
                    return Ok(());
                }
                n => decoder.extend(&buf[..n]),
            }
        }
    }

    /// Answer one request
    pub async fn handle(&self, frame: IntakeFrame) -> IntakeReply {
        match frame {
            IntakeFrame::Submit { request } => match self.context.submit(&request).await {
                Ok(receipt) => IntakeReply::Accepted { receipt },
                Err(error) => IntakeReply::Rejected { error },
            },
            IntakeFrame::Cancel { command_id } => {
                match self.context.cancel(&command_id, "cancelled by caller").await {
                    Some(outcome) => IntakeReply::Outcome { outcome },
                    None => IntakeReply::NotFound { command_id },
                }
            }
            IntakeFrame::Status { command_id } => match self.context.status(&command_id).await {
                Some(outcome) => IntakeReply::Outcome { outcome },
                None => IntakeReply::NotFound { command_id },
            },
            IntakeFrame::Wait {
                command_id,
                timeout_ms,
            } => {
                let bound = Duration::from_millis(timeout_ms.min(self.context.config().max_timeout_ms));
                match self.context.wait(&command_id, bound).await {
                    Some(outcome) => IntakeReply::Outcome { outcome },
                    None => IntakeReply::NotFound { command_id },
                }
            }
        }
    }
}
