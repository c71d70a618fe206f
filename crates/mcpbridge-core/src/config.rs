//! Gateway configuration — serde structs for the JSON config file.
//!
//! Every section has serde defaults, so a missing file or a partial file
//! yields a fully usable configuration. Unknown keys are ignored.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub coordinator: CoordinatorConfig,
    pub llm: LlmConfig,
    pub prompt_guard: PromptGuardConfig,
    pub flow: FlowConfig,
    pub conversation: ConversationConfig,
    /// Registered MCP tool servers.
    pub mcps: Vec<McpEntry>,
}

/// Static registration of one MCP tool server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpEntry {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub tools: Vec<McpToolEntry>,
}

/// One advertised tool on an MCP.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: serde_json::Value,
    /// Whether results may be cached. Unset falls back to the write-like
    /// name heuristic.
    #[serde(default)]
    pub idempotent: Option<bool>,
    /// Per-invocation cost surcharge.
    #[serde(default)]
    pub surcharge: Option<f64>,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

impl BridgeConfig {
    /// Load from a specific path. Missing or malformed files fall back to
    /// defaults; a malformed file is an operator error worth logging at the
    /// call site, not a startup failure.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8750,
            bind: "0.0.0.0".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub health_interval_seconds: u64,
    pub health_timeout_seconds: u64,
    pub dispatch_timeout_seconds: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            health_interval_seconds: 30,
            health_timeout_seconds: 3,
            dispatch_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub tool_iteration_cap: usize,
    pub request_timeout_seconds: u64,
    pub default_model: String,
    pub max_tokens: u32,
    /// Flat price per token (input + output).
    pub price_per_token: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            tool_iteration_cap: 10,
            request_timeout_seconds: 120,
            default_model: "claude-sonnet-4-20250514".into(),
            max_tokens: 8192,
            price_per_token: 0.000_002,
        }
    }
}

/// Escalation window scope for unsafe-verdict counting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardWindow {
    Message,
    #[default]
    Session,
    Day,
}

/// What to do when a message is judged unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardAction {
    Warn,
    BlockMessage,
    BlockUser,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardBehaviorConfig {
    pub window: GuardWindow,
    pub warn_at: u32,
    pub block_at: u32,
}

impl Default for GuardBehaviorConfig {
    fn default() -> Self {
        Self {
            window: GuardWindow::Session,
            warn_at: 2,
            block_at: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptGuardConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub threshold: f64,
    pub bypass_roles: Vec<String>,
    pub behavior: GuardBehaviorConfig,
    /// Escalation ladder: below warn_at, at warn_at, at block_at.
    pub actions: Vec<GuardAction>,
}

impl Default for PromptGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 2000,
            threshold: 0.5,
            bypass_roles: Vec::new(),
            behavior: GuardBehaviorConfig::default(),
            actions: vec![
                GuardAction::Warn,
                GuardAction::BlockMessage,
                GuardAction::BlockUser,
            ],
        }
    }
}

impl PromptGuardConfig {
    /// Pick the action for the `count`-th unsafe verdict in the window.
    pub fn action_for(&self, count: u32) -> GuardAction {
        let idx = if count >= self.behavior.block_at {
            2
        } else if count >= self.behavior.warn_at {
            1
        } else {
            0
        };
        self.actions
            .get(idx)
            .or_else(|| self.actions.last())
            .copied()
            .unwrap_or(GuardAction::Warn)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Event-log retention for live streams; durable archives outlive this.
    pub default_ttl_hours: u64,
    /// Per-observer outbound queue depth; a full queue drops the observer.
    pub observer_queue_depth: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            default_ttl_hours: 24,
            observer_queue_depth: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub idle_timeout_seconds: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_surface() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.cache.max_entries, 1000);
        assert_eq!(cfg.cache.ttl_seconds, 300);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.cooldown_seconds, 30);
        assert_eq!(cfg.coordinator.health_interval_seconds, 30);
        assert_eq!(cfg.llm.tool_iteration_cap, 10);
        assert!(cfg.prompt_guard.enabled);
        assert_eq!(cfg.prompt_guard.timeout_ms, 2000);
        assert_eq!(cfg.prompt_guard.behavior.warn_at, 2);
        assert_eq!(cfg.prompt_guard.behavior.block_at, 5);
        assert_eq!(cfg.flow.default_ttl_hours, 24);
        assert_eq!(cfg.conversation.idle_timeout_seconds, 300);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: BridgeConfig =
            serde_json::from_str(r#"{ "cache": { "max_entries": 10 } }"#).unwrap();
        assert_eq!(cfg.cache.max_entries, 10);
        assert_eq!(cfg.cache.ttl_seconds, 300);
        assert_eq!(cfg.breaker.failure_threshold, 5);
    }

    #[test]
    fn escalation_ladder() {
        let cfg = PromptGuardConfig {
            behavior: GuardBehaviorConfig {
                window: GuardWindow::Session,
                warn_at: 2,
                block_at: 3,
            },
            ..Default::default()
        };
        assert_eq!(cfg.action_for(1), GuardAction::Warn);
        assert_eq!(cfg.action_for(2), GuardAction::BlockMessage);
        assert_eq!(cfg.action_for(3), GuardAction::BlockUser);
        assert_eq!(cfg.action_for(7), GuardAction::BlockUser);
    }
}
