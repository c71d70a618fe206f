//! Chat WebSocket adapter.
//!
//! A writer task is the sole owner of the socket sink, so frames reach the
//! client in exact engine emission order. The reader side keeps watching
//! the socket while a message is in flight, so a disconnect cancels the
//! engine immediately; messages that arrive mid-flight queue and run in
//! order.

use crate::identity;
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use mcpbridge_core::{AuditSource, ClientFrame, Error, ServerFrame, CLOSE_NORMAL};
use mcpbridge_engine::{Conversation, FrameSink, Identity};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per-client outbound frame buffer.
const OUTBOUND_BUFFER: usize = 256;
/// How long a full buffer may stall the engine before the client is
/// declared gone.
const SLOW_CLIENT_GRACE: Duration = Duration::from_secs(10);

pub async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let identity = identity::from_headers(&headers);
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state, identity))
}

enum WriterCmd {
    Frame(ServerFrame),
    Close(u16),
}

/// Frame sink backed by the writer channel. Backpressure from a slow
/// client stalls sends; past the grace period the client counts as gone.
struct ChannelSink {
    tx: mpsc::Sender<WriterCmd>,
}

#[async_trait::async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), Error> {
        match tokio::time::timeout(SLOW_CLIENT_GRACE, self.tx.send(WriterCmd::Frame(frame))).await
        {
            Ok(Ok(())) => Ok(()),
            _ => Err(Error::ClientGone),
        }
    }
}

async fn handle_chat_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Option<Identity>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<WriterCmd>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(cmd) = frame_rx.recv().await {
            match cmd {
                WriterCmd::Frame(frame) => {
                    let Ok(json) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
                WriterCmd::Close(code) => {
                    let _ = ws_tx
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let user_id = identity.as_ref().map(|i| i.user_id).unwrap_or(0);
    // The conversation is a transport concept: it lives exactly as long as
    // this socket and is only referenced from session records.
    let mut conversation = Conversation::new(user_id);
    info!(conversation = %conversation.id, user_id, "chat connection opened");

    let mut pending: VecDeque<String> = VecDeque::new();

    let idle_timeout = Duration::from_secs(state.config.conversation.idle_timeout_seconds);

    'connection: loop {
        let raw = match pending.pop_front() {
            Some(t) => t,
            None => match tokio::time::timeout(idle_timeout, ws_rx.next()).await {
                Err(_) => {
                    info!(conversation = %conversation.id, "idle timeout, closing");
                    break;
                }
                Ok(Some(Ok(WsMessage::Text(t)))) => t,
                Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => break,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => {
                    warn!("websocket read error: {e}");
                    break;
                }
            },
        };

        let text = match serde_json::from_str::<ClientFrame>(&raw) {
            Ok(ClientFrame::Message { text }) => text,
            Err(_) => {
                let _ = frame_tx
                    .send(WriterCmd::Frame(ServerFrame::Error {
                        error: "unparseable frame".into(),
                        code: "bad_request".into(),
                    }))
                    .await;
                continue;
            }
        };

        let cancel = CancellationToken::new();
        let mut task = tokio::spawn({
            let engine = state.engine.clone();
            let identity = identity.clone();
            let cancel = cancel.clone();
            let mut sink = ChannelSink {
                tx: frame_tx.clone(),
            };
            let mut conv = conversation;
            async move {
                let result = engine
                    .handle_message(
                        identity.as_ref(),
                        &mut conv,
                        &text,
                        AuditSource::ChatWs,
                        &mut sink,
                        cancel,
                    )
                    .await;
                (conv, result)
            }
        });

        // Keep reading the socket while the engine runs, so a disconnect
        // cancels in-flight LLM and MCP work.
        let (conv, result) = loop {
            tokio::select! {
                joined = &mut task => match joined {
                    Ok(pair) => break pair,
                    Err(e) => {
                        warn!("engine task failed: {e}");
                        break 'connection;
                    }
                },
                msg = ws_rx.next() => match msg {
                    Some(Ok(WsMessage::Text(t))) => pending.push_back(t),
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => {
                        cancel.cancel();
                        // Let the engine archive the partial session.
                        let _ = (&mut task).await;
                        break 'connection;
                    }
                    Some(Ok(_)) => {}
                },
            }
        };
        conversation = conv;

        if let Err(e) = result {
            if let Some(code) = e.close_code() {
                let _ = frame_tx.send(WriterCmd::Close(code)).await;
                break;
            }
            // Other errors were surfaced as frames; keep the connection.
        }
    }

    let _ = frame_tx.send(WriterCmd::Close(CLOSE_NORMAL)).await;
    drop(frame_tx);
    let _ = writer.await;
    info!(user_id, "chat connection closed");
}
