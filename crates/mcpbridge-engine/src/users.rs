//! User directory — the source of per-user context for the pipeline.
//!
//! The identity service itself is external; this directory materializes a
//! `UserContext` from the gateway-injected identity plus locally held
//! overrides (block flags, per-user rules).

use dashmap::DashMap;
use mcpbridge_core::{Result, ToolRules, UserContext};

#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// Load the context for an authenticated identity.
    async fn lookup(&self, user_id: i64, username: &str, role: &str) -> Result<UserContext>;

    /// Set the block flag. Future messages fail at block_check.
    async fn set_blocked(&self, user_id: i64, reason: &str);
}

/// Per-role defaults applied when no explicit user entry exists.
#[derive(Debug, Clone)]
pub struct RolePolicy {
    pub allowed_mcps: Vec<String>,
    pub daily_limit: f64,
}

/// In-memory directory: explicit entries win, otherwise role policy,
/// otherwise the default policy.
pub struct MemoryUserDirectory {
    users: DashMap<i64, UserContext>,
    roles: DashMap<String, RolePolicy>,
    default_policy: RolePolicy,
}

impl MemoryUserDirectory {
    pub fn new(default_policy: RolePolicy) -> Self {
        Self {
            users: DashMap::new(),
            roles: DashMap::new(),
            default_policy,
        }
    }

    pub fn set_role_policy(&self, role: impl Into<String>, policy: RolePolicy) {
        self.roles.insert(role.into(), policy);
    }

    /// Insert or replace an explicit user entry.
    pub fn upsert(&self, user: UserContext) {
        self.users.insert(user.user_id, user);
    }

    pub fn get(&self, user_id: i64) -> Option<UserContext> {
        self.users.get(&user_id).map(|u| u.clone())
    }
}

#[async_trait::async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn lookup(&self, user_id: i64, username: &str, role: &str) -> Result<UserContext> {
        if let Some(user) = self.users.get(&user_id) {
            return Ok(user.clone());
        }
        let policy = self
            .roles
            .get(role)
            .map(|p| p.clone())
            .unwrap_or_else(|| self.default_policy.clone());
        Ok(UserContext {
            user_id,
            username: username.to_string(),
            role: role.to_string(),
            allowed_mcps: policy.allowed_mcps,
            tool_rules: ToolRules::default(),
            blocked: None,
            active: true,
            daily_limit: policy.daily_limit,
        })
    }

    async fn set_blocked(&self, user_id: i64, reason: &str) {
        // Entry API keeps this a single shard operation; a get_mut/insert
        // pair would re-lock the shard while still holding the guard.
        self.users
            .entry(user_id)
            .and_modify(|user| user.blocked = Some(reason.to_string()))
            .or_insert_with(|| {
                // No entry yet: materialize one from the default policy so
                // the flag survives until the user next appears.
                let policy = self.default_policy.clone();
                UserContext {
                    user_id,
                    username: String::new(),
                    role: String::new(),
                    allowed_mcps: policy.allowed_mcps,
                    tool_rules: ToolRules::default(),
                    blocked: Some(reason.to_string()),
                    active: true,
                    daily_limit: policy.daily_limit,
                }
            });
    }
}
