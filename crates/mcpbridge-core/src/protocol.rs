//! Wire protocol — chat client frames, admin observer frames.
//!
//! Chat, client → server:
//!   { "type": "message", "text": "weather in NYC" }
//!
//! Chat, server → client:
//!   { "type": "welcome", "text": "...", "usage": {...}, "available_mcps": [...] }
//!   { "type": "token", "text": "..." }
//!   { "type": "tool_call", "mcp": "weather_mcp", "tool": "lookup" }
//!   { "type": "tool_result", "status": "ok", "duration_ms": 12 }
//!   { "type": "done", "result": { "tokens": 321, "cost": 0.004 } }
//!   { "type": "error", "error": "...", "code": "quota_exceeded" }
//!
//! The same server frames travel newline-delimited over the one-shot
//! streaming endpoint.

use crate::error::Error;
use crate::types::{FlowEvent, FlowEventKind};
use serde::{Deserialize, Serialize};

/// Close when authentication or role checks fail.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close on unexpected internal failure.
pub const CLOSE_INTERNAL: u16 = 1011;
/// Normal close.
pub const CLOSE_NORMAL: u16 = 1000;

// ---------------------------------------------------------------------------
// Chat protocol
// ---------------------------------------------------------------------------

/// Client-to-server chat frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { text: String },
}

/// Usage snapshot carried in the welcome frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub used: f64,
    pub limit: f64,
    pub remaining: f64,
}

/// Final metadata carried in the done frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneResult {
    pub tokens: u64,
    pub cost: f64,
}

/// Tool dispatch outcome as shown to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
}

/// Server-to-client chat frames, sent in strict engine emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        text: String,
        usage: UsageSnapshot,
        available_mcps: Vec<String>,
    },
    Token {
        text: String,
    },
    ToolCall {
        mcp: String,
        tool: String,
    },
    ToolResult {
        status: ToolStatus,
        duration_ms: u64,
    },
    Done {
        result: DoneResult,
    },
    Error {
        error: String,
        code: String,
    },
}

impl ServerFrame {
    pub fn token(text: impl Into<String>) -> Self {
        Self::Token { text: text.into() }
    }

    pub fn done(tokens: u64, cost: f64) -> Self {
        Self::Done {
            result: DoneResult { tokens, cost },
        }
    }

    pub fn error(err: &Error) -> Self {
        Self::Error {
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Admin observer protocol
// ---------------------------------------------------------------------------

/// Subscription predicate for admin observers. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObserverFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<FlowEventKind>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcps: Option<Vec<String>>,
}

impl ObserverFilter {
    /// Whether a published event for `user_id` passes this filter.
    pub fn matches(&self, user_id: i64, event: &FlowEvent) -> bool {
        if self.user_id.is_some_and(|u| u != user_id) {
            return false;
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(mcps) = &self.mcps {
            let event_mcp = event.payload.get("mcp").and_then(|v| v.as_str());
            match event_mcp {
                Some(m) => {
                    if !mcps.iter().any(|x| x == m) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// Admin observer, client → server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminClientFrame {
    Subscribe {
        #[serde(default)]
        filter: ObserverFilter,
    },
    Unsubscribe,
    Ping,
}

/// Admin observer, server → client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminServerFrame {
    Subscribed,
    Unsubscribed,
    Pong,
    FlowEvent {
        user_id: i64,
        session_id: String,
        event: FlowEvent,
    },
    McpStatusChange {
        mcp: String,
        healthy: bool,
    },
    Error {
        error: String,
    },
}
