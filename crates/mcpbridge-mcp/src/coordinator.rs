//! MCP coordinator: registry, permission-filtered catalogs, dispatch
//! through cache and breaker, and the periodic health prober.

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::cache::{CacheKey, ToolCache};
use crate::descriptor::{HealthState, McpDescriptor, ToolDescriptor};
use crate::error::{McpError, McpResult};
use crate::fingerprint::fingerprint;
use crate::transport::McpTransport;
use mcpbridge_core::{BridgeConfig, UserContext};
use mcpbridge_llm::LlmTool;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Separator between MCP and tool in the qualified names advertised to the
/// LLM. MCP names must not contain it.
const QUALIFIER: &str = "__";

/// Health transition broadcast to admin observers.
#[derive(Debug, Clone)]
pub struct McpStatusChange {
    pub mcp: String,
    pub healthy: bool,
}

/// Outcome of one dispatch.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub value: serde_json::Value,
    pub fingerprint: String,
    pub duration_ms: u64,
    pub cache_hit: bool,
}

struct McpRuntime {
    descriptor: RwLock<McpDescriptor>,
    breaker: CircuitBreaker,
}

pub struct McpCoordinator {
    mcps: dashmap::DashMap<String, Arc<McpRuntime>>,
    transport: Arc<dyn McpTransport>,
    cache: ToolCache,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
    dispatch_timeout: Duration,
    health_interval: Duration,
    status_tx: broadcast::Sender<McpStatusChange>,
}

impl McpCoordinator {
    pub fn new(config: &BridgeConfig, transport: Arc<dyn McpTransport>) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        let coordinator = Self {
            mcps: dashmap::DashMap::new(),
            transport,
            cache: ToolCache::new(
                config.cache.max_entries,
                Duration::from_secs(config.cache.ttl_seconds),
            ),
            breaker_threshold: config.breaker.failure_threshold,
            breaker_cooldown: Duration::from_secs(config.breaker.cooldown_seconds),
            dispatch_timeout: Duration::from_secs(config.coordinator.dispatch_timeout_seconds),
            health_interval: Duration::from_secs(config.coordinator.health_interval_seconds),
            status_tx,
        };
        for entry in &config.mcps {
            coordinator.register(McpDescriptor::from(entry.clone()));
        }
        coordinator
    }

    pub fn register(&self, descriptor: McpDescriptor) {
        info!(mcp = %descriptor.name, tools = descriptor.tools.len(), "registering MCP");
        let runtime = McpRuntime {
            breaker: CircuitBreaker::new(self.breaker_threshold, self.breaker_cooldown),
            descriptor: RwLock::new(descriptor),
        };
        let name = runtime.descriptor.read().name.clone();
        self.mcps.insert(name, Arc::new(runtime));
    }

    pub fn cache(&self) -> &ToolCache {
        &self.cache
    }

    /// Every registered MCP name, regardless of permissions or health.
    pub fn available_mcps(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mcps.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Subscribe to health transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<McpStatusChange> {
        self.status_tx.subscribe()
    }

    /// Current descriptor snapshot, for admin/health surfaces.
    pub fn snapshot(&self) -> Vec<McpDescriptor> {
        let mut list: Vec<McpDescriptor> =
            self.mcps.iter().map(|e| e.descriptor.read().clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// The tools this user may invoke: role-permitted MCPs, per-tool
    /// allow/deny rules applied, breaker-open MCPs excluded.
    pub fn list_tools(&self, user: &UserContext) -> Vec<(String, ToolDescriptor)> {
        let mut out = Vec::new();
        for entry in self.mcps.iter() {
            let mcp_name = entry.key();
            if !user.allowed_mcps.iter().any(|m| m == mcp_name) {
                continue;
            }
            if entry.breaker.state() == BreakerState::Open {
                continue;
            }
            let descriptor = entry.descriptor.read();
            for tool in &descriptor.tools {
                if user.tool_rules.permits(mcp_name, &tool.name) {
                    out.push((mcp_name.clone(), tool.clone()));
                }
            }
        }
        out.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));
        out
    }

    /// The filtered catalog in LLM tool form, names qualified `mcp__tool`.
    pub fn llm_catalog(&self, user: &UserContext) -> Vec<LlmTool> {
        self.list_tools(user)
            .into_iter()
            .map(|(mcp, tool)| LlmTool {
                name: qualify(&mcp, &tool.name),
                description: tool.description,
                input_schema: tool.input_schema,
            })
            .collect()
    }

    /// Validate permission, consult the cache, then dispatch through the
    /// breaker. Successful idempotent results are cached.
    pub async fn invoke(
        &self,
        mcp: &str,
        tool: &str,
        args: &serde_json::Value,
        user: &UserContext,
    ) -> McpResult<Invocation> {
        let runtime = self
            .mcps
            .get(mcp)
            .map(|e| e.value().clone())
            .ok_or_else(|| McpError::ServerNotFound(mcp.to_string()))?;

        if !user.allowed_mcps.iter().any(|m| m == mcp) {
            return Err(McpError::permission_denied(format!(
                "MCP {mcp} not permitted for role {}",
                user.role
            )));
        }
        if !user.tool_rules.permits(mcp, tool) {
            return Err(McpError::permission_denied(format!(
                "tool {tool} denied on {mcp}"
            )));
        }

        let (endpoint, descriptor_tool) = {
            let descriptor = runtime.descriptor.read();
            let t = descriptor.tool(tool).cloned().ok_or_else(|| McpError::ToolNotFound {
                mcp: mcp.to_string(),
                tool: tool.to_string(),
            })?;
            (descriptor.endpoint.clone(), t)
        };

        let fp = fingerprint(args);
        let cacheable = descriptor_tool.cacheable();
        let key = CacheKey::new(mcp, tool, fp.clone());

        // Cache consultation precedes the breaker: a cached success served
        // while the breaker is open is fine.
        if cacheable {
            if let Some(value) = self.cache.get(&key) {
                debug!(mcp, tool, "cache hit");
                return Ok(Invocation {
                    value,
                    fingerprint: fp,
                    duration_ms: 0,
                    cache_hit: true,
                });
            }
        }

        if !runtime.breaker.acquire() {
            return Err(McpError::BreakerOpen(mcp.to_string()));
        }

        let start = Instant::now();
        let result = tokio::time::timeout(
            self.dispatch_timeout,
            self.transport.call_tool(&endpoint, tool, args),
        )
        .await
        .unwrap_or_else(|_| Err(McpError::Transport("dispatch timed out".into())));
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                runtime.breaker.record_success();
                if cacheable {
                    self.cache.put(key, value.clone());
                }
                Ok(Invocation {
                    value,
                    fingerprint: fp,
                    duration_ms,
                    cache_hit: false,
                })
            }
            Err(e) => {
                if e.counts_as_breaker_failure() {
                    runtime.breaker.record_failure();
                } else {
                    // The transport worked; the caller's arguments were bad.
                    runtime.breaker.record_success();
                }
                Err(e)
            }
        }
    }

    /// Probe every MCP once, updating health and feeding the breaker.
    /// MCPs with an open breaker in cool-down are skipped — an open breaker
    /// emits no transport calls.
    pub async fn probe_all(&self) {
        let runtimes: Vec<(String, Arc<McpRuntime>)> = self
            .mcps
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (name, runtime) in runtimes {
            if runtime.breaker.state() == BreakerState::Open {
                self.set_health(&name, &runtime, HealthState::Unhealthy);
                continue;
            }
            let endpoint = runtime.descriptor.read().endpoint.clone();
            match self.transport.health(&endpoint).await {
                Ok(()) => {
                    runtime.breaker.record_success();
                    self.set_health(&name, &runtime, HealthState::Healthy);
                }
                Err(e) => {
                    warn!(mcp = %name, "health probe failed: {e}");
                    runtime.breaker.record_failure();
                    self.set_health(&name, &runtime, HealthState::Unhealthy);
                }
            }
        }
    }

    fn set_health(&self, name: &str, runtime: &McpRuntime, health: HealthState) {
        let mut descriptor = runtime.descriptor.write();
        if descriptor.health != health {
            descriptor.health = health;
            let _ = self.status_tx.send(McpStatusChange {
                mcp: name.to_string(),
                healthy: health == HealthState::Healthy,
            });
        }
    }

    /// Background health prober. Stops when the shutdown signal changes.
    pub fn spawn_prober(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let interval = coordinator.health_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!("health prober started ({}s interval)", interval.as_secs());
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.probe_all().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("health prober stopped");
        })
    }

    /// Background cache evictor sweeping expired entries.
    pub fn spawn_cache_evictor(
        self: &Arc<Self>,
        sweep_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.cache.purge_expired(),
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }
}

/// Qualified tool name advertised to the LLM.
pub fn qualify(mcp: &str, tool: &str) -> String {
    format!("{mcp}{QUALIFIER}{tool}")
}

/// Split a qualified name back into (mcp, tool).
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once(QUALIFIER)
}
