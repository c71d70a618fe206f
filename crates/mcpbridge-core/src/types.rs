//! Core data model: user context, conversation/session identities,
//! flow events, tool invocations, and audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Conversation identifier — lives as long as one duplex client connection.
/// Cheaply cloneable.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct ConversationId(Arc<str>);

/// Session identifier — one user message and its response.
/// Cheaply cloneable.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct SessionId(Arc<str>);

macro_rules! arc_str_id {
    ($name:ident, $prefix:literal) => {
        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(Arc::from(s.into()))
            }

            /// Generate a fresh random identity.
            pub fn generate() -> Self {
                Self::new(format!(concat!($prefix, "{}"), uuid::Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                String::deserialize(deserializer).map(Self::new)
            }
        }
    };
}

arc_str_id!(ConversationId, "conv-");
arc_str_id!(SessionId, "sess-");

/// Per-tool allow/deny rules carried by a user context.
///
/// An MCP with an entry in `allow` only permits the listed tools; MCPs
/// without an entry permit everything not in `deny`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolRules {
    #[serde(default)]
    pub allow: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub deny: Vec<QualifiedTool>,
}

/// An (MCP, tool) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedTool {
    pub mcp: String,
    pub tool: String,
}

impl ToolRules {
    pub fn permits(&self, mcp: &str, tool: &str) -> bool {
        if self
            .deny
            .iter()
            .any(|q| q.mcp == mcp && q.tool == tool)
        {
            return false;
        }
        match self.allow.get(mcp) {
            Some(allowed) => allowed.iter().any(|t| t == tool),
            None => true,
        }
    }
}

/// User context, loaded once per message by the authorization pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: i64,
    pub username: String,
    pub role: String,
    /// MCP names this user's role may reach.
    #[serde(default)]
    pub allowed_mcps: Vec<String>,
    #[serde(default)]
    pub tool_rules: ToolRules,
    /// Block reason when the user is blocked.
    #[serde(default)]
    pub blocked: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Daily cost ceiling in configured currency units.
    pub daily_limit: f64,
}

fn default_true() -> bool {
    true
}

impl UserContext {
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// Full permission composition: MCP membership + per-tool rules.
    pub fn permits_tool(&self, mcp: &str, tool: &str) -> bool {
        self.allowed_mcps.iter().any(|m| m == mcp) && self.tool_rules.permits(mcp, tool)
    }
}

/// Closed set of flow-event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventKind {
    AuthCheck,
    BlockCheck,
    UsageCheck,
    McpPermissionCheck,
    ToolFilter,
    LlmThinking,
    ToolCall,
    ToolResult,
    LlmComplete,
    Error,
}

impl std::fmt::Display for FlowEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AuthCheck => "auth_check",
            Self::BlockCheck => "block_check",
            Self::UsageCheck => "usage_check",
            Self::McpPermissionCheck => "mcp_permission_check",
            Self::ToolFilter => "tool_filter",
            Self::LlmThinking => "llm_thinking",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::LlmComplete => "llm_complete",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One checkpoint within a session. Events link to a parent to form a tree
/// rooted at the first event; `parent_id`, when present, always references
/// an earlier event in the same session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub kind: FlowEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl FlowEvent {
    pub fn new(kind: FlowEventKind, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            kind,
            timestamp: Utc::now(),
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    pub fn child_of(mut self, parent: &FlowEvent) -> Self {
        self.parent_id = Some(parent.id.clone());
        self
    }
}

/// Record of one tool dispatch within a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub mcp: String,
    pub tool: String,
    /// Stable hash of the normalized arguments.
    pub fingerprint: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub cache_hit: bool,
}

/// Which transport produced an audit record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSource {
    ChatWs,
    ChatSse,
    McpGateway,
}

/// Emitted exactly once per completed message, on every terminal path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub session_id: SessionId,
    pub source: AuditSource,
    pub tokens: u64,
    pub cost: f64,
    pub tools_used: Vec<String>,
    pub mcps_used: Vec<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}
