//! Core types for mcpbridge: identities, flow events, audit records,
//! the error taxonomy, wire protocol frames, and the configuration surface.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use protocol::{
    AdminClientFrame, AdminServerFrame, ClientFrame, ObserverFilter, ServerFrame, ToolStatus,
    CLOSE_INTERNAL, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
pub use types::{
    AuditRecord, AuditSource, ConversationId, FlowEvent, FlowEventKind, QualifiedTool, SessionId,
    ToolInvocation, ToolRules, UserContext,
};
