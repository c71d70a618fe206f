//! MCP and tool descriptors.

use mcpbridge_core::config::{McpEntry, McpToolEntry};
use serde::{Deserialize, Serialize};

/// Health as last observed by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// One advertised tool on an MCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    /// Explicit idempotency declaration; unset falls back to the
    /// write-like name heuristic.
    pub idempotent: Option<bool>,
    /// Per-invocation cost surcharge.
    pub surcharge: Option<f64>,
}

impl From<McpToolEntry> for ToolDescriptor {
    fn from(e: McpToolEntry) -> Self {
        Self {
            name: e.name,
            description: e.description,
            input_schema: e.input_schema,
            idempotent: e.idempotent,
            surcharge: e.surcharge,
        }
    }
}

impl ToolDescriptor {
    /// Whether results for this tool may be served from cache.
    pub fn cacheable(&self) -> bool {
        self.idempotent
            .unwrap_or_else(|| !crate::cache::is_write_like(&self.name))
    }
}

/// A registered MCP tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpDescriptor {
    pub name: String,
    pub endpoint: String,
    pub tools: Vec<ToolDescriptor>,
    pub health: HealthState,
}

impl From<McpEntry> for McpDescriptor {
    fn from(e: McpEntry) -> Self {
        Self {
            name: e.name,
            endpoint: e.endpoint,
            tools: e.tools.into_iter().map(ToolDescriptor::from).collect(),
            health: HealthState::Unknown,
        }
    }
}

impl McpDescriptor {
    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }
}
