//! Authorization pipeline: a fixed linear sequence of checkpoints run per
//! incoming message. Every stage emits a flow event; a failing stage
//! short-circuits with the typed error. The output is a frozen view the
//! session engine consumes.

use crate::session::Session;
use crate::users::UserDirectory;
use mcpbridge_core::protocol::UsageSnapshot;
use mcpbridge_core::{Error, FlowEventKind, Result, UserContext};
use mcpbridge_flow::{AuditStore, FlowTracker};
use mcpbridge_llm::LlmTool;
use mcpbridge_mcp::{coordinator::qualify, McpCoordinator};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Authenticated identity injected by the upstream gateway. Its presence
/// is the proof of authentication — tokens are validated upstream.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    pub role: String,
}

/// Frozen pipeline output.
pub struct Admission {
    pub user: UserContext,
    /// Filtered tool catalog in LLM form, names qualified `mcp__tool`.
    pub tools: Vec<LlmTool>,
    /// Per-invocation surcharges by qualified tool name.
    pub surcharges: HashMap<String, f64>,
    pub usage: UsageSnapshot,
    pub welcome: String,
}

pub struct AuthPipeline {
    directory: Arc<dyn UserDirectory>,
    audit: Arc<dyn AuditStore>,
    coordinator: Arc<McpCoordinator>,
}

impl AuthPipeline {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        audit: Arc<dyn AuditStore>,
        coordinator: Arc<McpCoordinator>,
    ) -> Self {
        Self {
            directory,
            audit,
            coordinator,
        }
    }

    /// Run every checkpoint in order, emitting flow events as it goes.
    pub async fn admit(
        &self,
        tracker: &FlowTracker,
        session: &mut Session,
        identity: Option<&Identity>,
    ) -> Result<Admission> {
        // 1. auth_check — identity headers present and well-formed.
        let identity = match identity {
            Some(identity) => {
                session
                    .emit(
                        tracker,
                        FlowEventKind::AuthCheck,
                        json!({
                            "user_id": identity.user_id,
                            "username": &identity.username,
                            "role": &identity.role,
                        }),
                    )
                    .await;
                identity
            }
            None => {
                session
                    .emit(
                        tracker,
                        FlowEventKind::AuthCheck,
                        json!({ "error": "identity headers missing" }),
                    )
                    .await;
                return Err(Error::AuthMissing);
            }
        };

        let user = self
            .directory
            .lookup(identity.user_id, &identity.username, &identity.role)
            .await?;

        // 2. block_check.
        if let Some(reason) = &user.blocked {
            session
                .emit(
                    tracker,
                    FlowEventKind::BlockCheck,
                    json!({ "blocked": true, "reason": reason }),
                )
                .await;
            return Err(Error::Blocked {
                reason: reason.clone(),
            });
        }
        session
            .emit(tracker, FlowEventKind::BlockCheck, json!({ "blocked": false }))
            .await;

        // 3. active_check. Shares the block_check event kind; the payload
        // names the stage.
        session
            .emit(
                tracker,
                FlowEventKind::BlockCheck,
                json!({ "check": "active", "active": user.active }),
            )
            .await;
        if !user.active {
            return Err(Error::Inactive);
        }

        // 4. usage_check — today's spend against the role's daily limit.
        let today = chrono::Utc::now().date_naive();
        let used = self
            .audit
            .daily_cost(user.user_id, today)
            .await
            .map_err(|e| Error::internal(format!("usage lookup failed: {e}")))?;
        let remaining = (user.daily_limit - used).max(0.0);
        session
            .emit(
                tracker,
                FlowEventKind::UsageCheck,
                json!({
                    "used": used,
                    "limit": user.daily_limit,
                    "remaining": remaining,
                }),
            )
            .await;
        if used >= user.daily_limit {
            return Err(Error::QuotaExceeded {
                used,
                limit: user.daily_limit,
            });
        }

        // 5. mcp_permission_check — permitted set vs everything registered.
        let available = self.coordinator.available_mcps();
        let permitted: Vec<String> = available
            .iter()
            .filter(|m| user.allowed_mcps.iter().any(|a| a == *m))
            .cloned()
            .collect();
        session
            .emit(
                tracker,
                FlowEventKind::McpPermissionCheck,
                json!({ "permitted": &permitted, "available": &available }),
            )
            .await;

        // 6. tool_filter — per-tool allow/deny rules over the catalog.
        let catalog = self.coordinator.list_tools(&user);
        let surcharges: HashMap<String, f64> = catalog
            .iter()
            .filter_map(|(mcp, tool)| {
                tool.surcharge.map(|s| (qualify(mcp, &tool.name), s))
            })
            .collect();
        let tool_names: Vec<String> = catalog
            .iter()
            .map(|(mcp, tool)| qualify(mcp, &tool.name))
            .collect();
        session
            .emit(
                tracker,
                FlowEventKind::ToolFilter,
                json!({ "tool_count": tool_names.len(), "tools": &tool_names }),
            )
            .await;

        let tools: Vec<LlmTool> = catalog
            .into_iter()
            .map(|(mcp, tool)| LlmTool {
                name: qualify(&mcp, &tool.name),
                description: tool.description,
                input_schema: tool.input_schema,
            })
            .collect();
        let usage = UsageSnapshot {
            used,
            limit: user.daily_limit,
            remaining,
        };
        let welcome = format!(
            "Welcome {}! Budget today: {:.2} of {:.2} used. {} tools across {} MCPs.",
            user.username,
            used,
            user.daily_limit,
            tools.len(),
            permitted.len(),
        );

        Ok(Admission {
            user,
            tools,
            surcharges,
            usage,
            welcome,
        })
    }
}
