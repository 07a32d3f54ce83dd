mod common;

use common::*;
use mcp_shared::codec::{self, FrameDecoder};
use mcp_shared::{ErrorKind, ExecutionState, IntakeFrame, IntakeReply};
use robot_mcp::transport::SimBehavior;
use robot_mcp::IntakeServer;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Caller {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl Caller {
    async fn ask(&mut self, frame: IntakeFrame) -> IntakeReply {
        self.stream.write_all(&codec::encode(&frame).unwrap()).await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(reply) = self.decoder.decode_next::<IntakeReply>().unwrap() {
                return reply;
            }
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "intake closed the connection");
            self.decoder.extend(&buf[..n]);
        }
    }
}

async fn serve() -> (Arc<robot_mcp::McpContext>, Caller) {
    let ctx = Arc::new(context());
    ctx.add_sim_robot("rover-1", Some("rover"), &["drive"], SimBehavior::ack_after(5));
    ctx.start();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(IntakeServer::new(ctx.clone()));
    tokio::spawn(server.serve(listener));

    let caller = Caller {
        stream: TcpStream::connect(addr).await.unwrap(),
        decoder: FrameDecoder::new(),
    };
    (ctx, caller)
}

#[tokio::test]
async fn test_submit_and_wait_over_tcp() {
    let (ctx, mut caller) = serve().await;

    let reply = caller
        .ask(IntakeFrame::Submit {
            request: move_on("i-1", "rover-1"),
        })
        .await;
    match reply {
        IntakeReply::Accepted { receipt } => {
            assert_eq!(receipt.command_id, "i-1");
            assert_eq!(receipt.trace_id, "trace-i-1");
        }
        other => panic!("unexpected reply {:?}", other),
    }

    let reply = caller
        .ask(IntakeFrame::Wait {
            command_id: "i-1".into(),
            timeout_ms: 5_000,
        })
        .await;
    match reply {
        IntakeReply::Outcome { outcome } => assert_eq!(outcome.state, ExecutionState::Succeeded),
        other => panic!("unexpected reply {:?}", other),
    }
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_rejections_and_unknown_ids() {
    let (ctx, mut caller) = serve().await;

    let mut request = move_on("i-2", "rover-1");
    request["auth_token"] = json!("short");
    match caller.ask(IntakeFrame::Submit { request }).await {
        IntakeReply::Rejected { error } => {
            assert_eq!(error.kind, ErrorKind::Validation);
            assert_eq!(error.field.as_deref(), Some("auth_token"));
        }
        other => panic!("unexpected reply {:?}", other),
    }

    let reply = caller
        .ask(IntakeFrame::Status {
            command_id: "i-2".into(),
        })
        .await;
    assert_eq!(
        reply,
        IntakeReply::NotFound {
            command_id: "i-2".into()
        }
    );
    ctx.shutdown().await;
}
