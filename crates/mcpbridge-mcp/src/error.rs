//! MCP error types.

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("MCP not found: {0}")]
    ServerNotFound(String),

    #[error("tool not found: {mcp}.{tool}")]
    ToolNotFound { mcp: String, tool: String },

    #[error("permission denied: {detail}")]
    PermissionDenied { detail: String },

    #[error("circuit breaker open for {0}")]
    BreakerOpen(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tool error: {message}")]
    Tool {
        message: String,
        /// Server-side failures count against the breaker; user-caused
        /// errors (bad arguments) do not.
        server_fault: bool,
    },
}

impl McpError {
    pub fn permission_denied(detail: impl Into<String>) -> Self {
        Self::PermissionDenied {
            detail: detail.into(),
        }
    }

    pub fn tool_error(message: impl Into<String>, server_fault: bool) -> Self {
        Self::Tool {
            message: message.into(),
            server_fault,
        }
    }

    /// Whether this outcome counts as a failure for the circuit breaker.
    pub fn counts_as_breaker_failure(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Tool { server_fault, .. } => *server_fault,
            _ => false,
        }
    }
}

impl From<McpError> for mcpbridge_core::Error {
    fn from(e: McpError) -> Self {
        match e {
            McpError::ServerNotFound(m) => {
                mcpbridge_core::Error::permission_denied(format!("unknown MCP: {m}"))
            }
            McpError::ToolNotFound { mcp, tool } => {
                mcpbridge_core::Error::Tool(format!("unknown tool {mcp}.{tool}"))
            }
            McpError::PermissionDenied { detail } => {
                mcpbridge_core::Error::PermissionDenied { detail }
            }
            McpError::BreakerOpen(mcp) => mcpbridge_core::Error::BreakerOpen { mcp },
            McpError::Transport(m) => mcpbridge_core::Error::Transport(m),
            McpError::Tool { message, .. } => mcpbridge_core::Error::Tool(message),
        }
    }
}
