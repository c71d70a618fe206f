//! One-shot streaming endpoint: `POST /ask/stream`.
//!
//! Newline-delimited JSON records with the same payload shapes as the
//! WebSocket frames. No conversation identity is recorded for this
//! transport.

use crate::identity;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use mcpbridge_core::{AuditSource, Error, ServerFrame};
use mcpbridge_engine::{Conversation, FrameSink};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Deserialize)]
pub struct AskRequest {
    pub text: String,
}

struct NdjsonSink {
    tx: mpsc::Sender<ServerFrame>,
}

#[async_trait::async_trait]
impl FrameSink for NdjsonSink {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), Error> {
        // The receiver drops when the HTTP client goes away.
        self.tx.send(frame).await.map_err(|_| Error::ClientGone)
    }
}

pub async fn ask_stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<AskRequest>,
) -> Result<Response, StatusCode> {
    let identity = identity::from_headers(&headers);
    if identity.is_none() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let (tx, rx) = mpsc::channel::<ServerFrame>(64);
    let cancel = CancellationToken::new();

    tokio::spawn({
        let engine = state.engine.clone();
        let cancel = cancel.clone();
        async move {
            let user_id = identity.as_ref().map(|i| i.user_id).unwrap_or(0);
            // Ephemeral conversation; ChatSse audit rows carry a null
            // conversation id.
            let mut conversation = Conversation::new(user_id);
            let mut sink = NdjsonSink { tx };
            let result = engine
                .handle_message(
                    identity.as_ref(),
                    &mut conversation,
                    &request.text,
                    AuditSource::ChatSse,
                    &mut sink,
                    cancel,
                )
                .await;
            if let Err(e) = result {
                debug!("one-shot stream ended with {}", e.code());
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(|frame| {
        let mut line = serde_json::to_string(&frame).unwrap_or_default();
        line.push('\n');
        Ok::<_, std::convert::Infallible>(line)
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
