//! Request/reply mediation with the external prompt scorer.
//!
//! Requests go out on a well-known channel; replies come back on
//! per-request channels and are demultiplexed by a single reply pump into
//! a map of pending oneshots. Timeouts drop the pending entry and fail
//! open.

use dashmap::DashMap;
use mcpbridge_core::config::PromptGuardConfig;
use mcpbridge_flow::EventLog;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

pub const GUARD_REQUEST_CHANNEL: &str = "guard:requests";
pub const GUARD_REPLY_PATTERN: &str = "guard:replies:*";

pub fn reply_channel(request_id: &str) -> String {
    format!("guard:replies:{request_id}")
}

/// Classification request published to the scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardRequest {
    pub request_id: String,
    pub user_id: i64,
    pub message: String,
}

/// Scorer verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub safe: bool,
    pub score: f64,
    pub reason: String,
}

/// A verdict resolved against the configured threshold.
#[derive(Debug, Clone)]
pub struct GuardOutcome {
    pub verdict: Verdict,
    /// Treated as unsafe: scorer said so, or the score crossed the
    /// threshold.
    pub flagged: bool,
    /// The scorer never answered; policy is fail-open.
    pub timed_out: bool,
}

impl GuardOutcome {
    fn safe_default(timed_out: bool) -> Self {
        Self {
            verdict: Verdict {
                safe: true,
                score: 0.0,
                reason: String::new(),
            },
            flagged: false,
            timed_out,
        }
    }
}

pub struct GuardMediator {
    log: Arc<dyn EventLog>,
    pending: DashMap<String, oneshot::Sender<Verdict>>,
    config: PromptGuardConfig,
}

impl GuardMediator {
    pub fn new(log: Arc<dyn EventLog>, config: PromptGuardConfig) -> Self {
        Self {
            log,
            pending: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &PromptGuardConfig {
        &self.config
    }

    /// Whether this role skips classification entirely.
    pub fn bypasses(&self, role: &str) -> bool {
        !self.config.enabled || self.config.bypass_roles.iter().any(|r| r == role)
    }

    /// Classify one message. Never errors: an unreachable or slow scorer
    /// fails open.
    pub async fn classify(&self, user_id: i64, text: &str) -> GuardOutcome {
        if !self.config.enabled {
            return GuardOutcome::safe_default(false);
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let request = GuardRequest {
            request_id: request_id.clone(),
            user_id,
            message: text.to_string(),
        };
        let payload = match serde_json::to_value(&request) {
            Ok(p) => p,
            Err(e) => {
                self.pending.remove(&request_id);
                warn!("guard request serialization failed: {e}");
                return GuardOutcome::safe_default(false);
            }
        };
        if let Err(e) = self.log.publish(GUARD_REQUEST_CHANNEL, payload).await {
            self.pending.remove(&request_id);
            warn!("guard request publish failed, failing open: {e}");
            return GuardOutcome::safe_default(false);
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(verdict)) => {
                let flagged = !verdict.safe || verdict.score >= self.config.threshold;
                GuardOutcome {
                    verdict,
                    flagged,
                    timed_out: false,
                }
            }
            // Timeout or a dropped sender both fail open.
            _ => {
                self.pending.remove(&request_id);
                warn!(user_id, "prompt guard timed out, failing open");
                GuardOutcome::safe_default(true)
            }
        }
    }

    /// Resolve a pending classification. Unknown ids (already timed out)
    /// are ignored.
    pub fn resolve(&self, request_id: &str, verdict: Verdict) {
        if let Some((_, tx)) = self.pending.remove(request_id) {
            let _ = tx.send(verdict);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Reply pump: demultiplex scorer replies into pending oneshots.
    pub fn spawn_reply_pump(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let mediator = Arc::clone(self);
        let mut subscription = mediator.log.subscribe(GUARD_REPLY_PATTERN);
        tokio::spawn(async move {
            info!("prompt-guard reply pump started");
            loop {
                tokio::select! {
                    msg = subscription.recv() => match msg {
                        Some(msg) => {
                            let request_id = msg
                                .channel
                                .rsplit(':')
                                .next()
                                .unwrap_or_default()
                                .to_string();
                            match serde_json::from_value::<Verdict>(msg.payload) {
                                Ok(verdict) => mediator.resolve(&request_id, verdict),
                                Err(e) => warn!("malformed guard reply: {e}"),
                            }
                        }
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("prompt-guard reply pump stopped");
        })
    }
}
