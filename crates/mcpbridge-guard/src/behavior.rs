//! Behavioral escalation: sliding counts of unsafe verdicts per user,
//! scoped to a configured window, mapped to an action ladder.
//!
//! Counts are in-memory and advisory; they reset on process restart.

use dashmap::DashMap;
use mcpbridge_core::config::{GuardAction, GuardWindow, PromptGuardConfig};
use mcpbridge_core::ConversationId;

pub struct BehaviorTracker {
    config: PromptGuardConfig,
    counts: DashMap<String, u32>,
}

impl BehaviorTracker {
    pub fn new(config: PromptGuardConfig) -> Self {
        Self {
            config,
            counts: DashMap::new(),
        }
    }

    fn window_key(&self, user_id: i64, conversation: Option<&ConversationId>) -> String {
        match self.config.behavior.window {
            // Per-message: no accumulation, every message stands alone.
            GuardWindow::Message => format!("msg:{user_id}"),
            GuardWindow::Session => match conversation {
                Some(c) => format!("conv:{user_id}:{c}"),
                None => format!("conv:{user_id}:oneshot"),
            },
            GuardWindow::Day => {
                format!("day:{user_id}:{}", chrono::Utc::now().date_naive())
            }
        }
    }

    /// Record one unsafe verdict and return (count in window, action).
    pub fn record_unsafe(
        &self,
        user_id: i64,
        conversation: Option<&ConversationId>,
    ) -> (u32, GuardAction) {
        let key = self.window_key(user_id, conversation);
        let count = if self.config.behavior.window == GuardWindow::Message {
            1
        } else {
            let mut entry = self.counts.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };
        (count, self.config.action_for(count))
    }

    /// Drop a conversation's window when its connection closes.
    pub fn forget_conversation(&self, user_id: i64, conversation: &ConversationId) {
        self.counts
            .remove(&format!("conv:{user_id}:{conversation}"));
    }
}
