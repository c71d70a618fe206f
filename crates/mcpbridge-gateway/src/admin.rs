//! Admin observer WebSocket: live flow events and MCP status changes,
//! filtered per subscription.

use crate::identity;
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use mcpbridge_core::{AdminClientFrame, AdminServerFrame, CLOSE_POLICY_VIOLATION};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn admin_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let authorized = identity::from_headers(&headers)
        .map(|i| identity::is_admin(&i))
        .unwrap_or(false);
    ws.on_upgrade(move |socket| handle_admin_socket(socket, state, authorized))
}

async fn handle_admin_socket(socket: WebSocket, state: Arc<AppState>, authorized: bool) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    if !authorized {
        let _ = ws_tx
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: "admin role required".into(),
            })))
            .await;
        return;
    }

    let observer_id = format!("obs-{}", uuid::Uuid::new_v4());
    info!(observer = %observer_id, "admin observer connected");
    let mut feed: Option<mpsc::Receiver<AdminServerFrame>> = None;

    loop {
        tokio::select! {
            // Forward broadcast frames once subscribed.
            frame = recv_feed(&mut feed) => match frame {
                Some(frame) => {
                    let Ok(json) = serde_json::to_string(&frame) else { continue };
                    if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
                // The broadcaster dropped us (slow consumer).
                None => break,
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = match serde_json::from_str::<AdminClientFrame>(&text) {
                        Ok(AdminClientFrame::Subscribe { filter }) => {
                            feed = Some(state.broadcaster.subscribe(&observer_id, filter));
                            AdminServerFrame::Subscribed
                        }
                        Ok(AdminClientFrame::Unsubscribe) => {
                            state.broadcaster.unsubscribe(&observer_id);
                            feed = None;
                            AdminServerFrame::Unsubscribed
                        }
                        Ok(AdminClientFrame::Ping) => AdminServerFrame::Pong,
                        Err(e) => AdminServerFrame::Error {
                            error: format!("unparseable frame: {e}"),
                        },
                    };
                    let Ok(json) = serde_json::to_string(&reply) else { continue };
                    if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("admin websocket error: {e}");
                    break;
                }
            },
        }
    }

    state.broadcaster.unsubscribe(&observer_id);
    info!(observer = %observer_id, "admin observer disconnected");
}

/// Await the feed when present; pend forever when not (so select! falls
/// through to socket reads).
async fn recv_feed(feed: &mut Option<mpsc::Receiver<AdminServerFrame>>) -> Option<AdminServerFrame> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
