//! Error taxonomy for the gateway data plane.
//!
//! Every user-visible failure maps to one variant here; `code()` is the
//! stable wire code carried in error frames, `close_code()` the WebSocket
//! close code where one applies.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication required")]
    AuthMissing,

    #[error("user is blocked: {reason}")]
    Blocked { reason: String },

    #[error("user is inactive")]
    Inactive,

    #[error("daily quota exceeded: used {used:.2} of {limit:.2}")]
    QuotaExceeded { used: f64, limit: f64 },

    #[error("permission denied: {detail}")]
    PermissionDenied { detail: String },

    #[error("circuit breaker open for {mcp}")]
    BreakerOpen { mcp: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("message rejected by prompt guard: {reason}")]
    PromptUnsafe { reason: String },

    #[error("tool iteration cap reached ({cap})")]
    IterationCap { cap: usize },

    #[error("client disconnected")]
    ClientGone,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn permission_denied(detail: impl Into<String>) -> Self {
        Self::PermissionDenied {
            detail: detail.into(),
        }
    }

    /// Stable wire code for error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::Blocked { .. } => "blocked",
            Self::Inactive => "inactive",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Transport(_) => "transport_error",
            Self::Tool(_) => "tool_error",
            Self::PromptUnsafe { .. } => "prompt_unsafe",
            Self::IterationCap { .. } => "iteration_cap",
            Self::ClientGone => "client_gone",
            Self::Internal(_) | Self::Json(_) => "internal",
        }
    }

    /// WebSocket close code, when the error should close the connection.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::AuthMissing => Some(crate::protocol::CLOSE_POLICY_VIOLATION),
            Self::Internal(_) | Self::Json(_) => Some(crate::protocol::CLOSE_INTERNAL),
            _ => None,
        }
    }

    /// Whether the LLM gets a structured tool error it can recover from,
    /// rather than the session terminating.
    pub fn recoverable_in_loop(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::BreakerOpen { .. } | Self::Transport(_) | Self::Tool(_)
        )
    }
}
