//! Conversation and session state.
//!
//! A conversation lives as long as one duplex connection and is never
//! persisted as an entity; a session covers one user message and its
//! response, and is the unit of flow tracking and audit. The engine owns
//! both exclusively for their lifetimes, so neither needs interior locking.

use chrono::{DateTime, Utc};
use mcpbridge_core::{ConversationId, FlowEvent, FlowEventKind, SessionId, ToolInvocation};
use mcpbridge_flow::FlowTracker;
use mcpbridge_llm::{ContentBlock, LlmContent, LlmMessage, Usage};

/// One duplex client connection's accumulated exchange.
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    /// Most recent session run under this conversation.
    pub last_session: Option<SessionId>,
    messages: Vec<LlmMessage>,
}

impl Conversation {
    pub fn new(user_id: i64) -> Self {
        Self {
            id: ConversationId::generate(),
            user_id,
            created_at: Utc::now(),
            last_session: None,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> Vec<LlmMessage> {
        self.messages.clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn push_user(&mut self, text: &str) {
        self.messages.push(LlmMessage::user(text));
    }

    pub fn push_assistant(&mut self, text: Option<&str>, tool_calls: Vec<ContentBlock>) {
        if tool_calls.is_empty() {
            self.messages
                .push(LlmMessage::assistant(text.unwrap_or_default()));
            return;
        }
        let mut blocks = Vec::new();
        if let Some(t) = text {
            if !t.is_empty() {
                blocks.push(ContentBlock::Text {
                    text: t.to_string(),
                });
            }
        }
        blocks.extend(tool_calls);
        self.messages.push(LlmMessage {
            role: "assistant".into(),
            content: LlmContent::Blocks(blocks),
        });
    }

    /// Append a tool result. All results for one assistant turn share a
    /// single user message, so consecutive results merge into the last
    /// message when it is already a tool-result carrier.
    pub fn push_tool_result(&mut self, tool_use_id: &str, content: &str, is_error: bool) {
        let block = ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: content.to_string(),
            is_error: if is_error { Some(true) } else { None },
        };

        if let Some(last) = self.messages.last_mut() {
            if last.role == "user" {
                if let LlmContent::Blocks(blocks) = &mut last.content {
                    if blocks
                        .iter()
                        .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
                    {
                        blocks.push(block);
                        return;
                    }
                }
            }
        }
        self.messages.push(LlmMessage {
            role: "user".into(),
            content: LlmContent::Blocks(vec![block]),
        });
    }
}

/// One user message and its response. Owns the ordered event list until
/// archival.
pub struct Session {
    pub id: SessionId,
    pub conversation_id: Option<ConversationId>,
    pub user_id: i64,
    /// Frozen at session start; flips of the monitoring set mid-session
    /// don't affect in-flight fan-out.
    pub monitored: bool,
    pub started_at: DateTime<Utc>,
    pub invocations: Vec<ToolInvocation>,
    pub usage: Usage,
    pub cost: f64,
    events: Vec<FlowEvent>,
    last_event_id: Option<String>,
}

impl Session {
    pub fn new(user_id: i64, conversation_id: Option<ConversationId>, monitored: bool) -> Self {
        Self {
            id: SessionId::generate(),
            conversation_id,
            user_id,
            monitored,
            started_at: Utc::now(),
            invocations: Vec::new(),
            usage: Usage::default(),
            cost: 0.0,
            events: Vec::new(),
            last_event_id: None,
        }
    }

    /// Emit a flow event: parent-linked to the previous event, kept in the
    /// session's list, and recorded through the tracker.
    pub async fn emit(
        &mut self,
        tracker: &FlowTracker,
        kind: FlowEventKind,
        payload: serde_json::Value,
    ) {
        let mut event = FlowEvent::new(kind, payload);
        event.parent_id = self.last_event_id.clone();
        self.last_event_id = Some(event.id.clone());
        tracker
            .record(self.user_id, &self.id, self.monitored, &event)
            .await;
        self.events.push(event);
    }

    pub fn events(&self) -> &[FlowEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<FlowEvent> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_results_merge_into_one_user_message() {
        let mut conversation = Conversation::new(1);
        conversation.push_user("do two things");
        conversation.push_assistant(
            None,
            vec![
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "a".into(),
                    input: serde_json::json!({}),
                },
                ContentBlock::ToolUse {
                    id: "t2".into(),
                    name: "b".into(),
                    input: serde_json::json!({}),
                },
            ],
        );
        conversation.push_tool_result("t1", "one", false);
        conversation.push_tool_result("t2", "two", true);

        assert_eq!(conversation.message_count(), 3);
        let messages = conversation.messages();
        match &messages[2].content {
            LlmContent::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_chain_to_their_predecessor() {
        use mcpbridge_flow::{MemoryEventLog, MemoryFlowStore, MonitorSet};
        use std::sync::Arc;
        use std::time::Duration;

        let tracker = FlowTracker::new(
            Arc::new(MemoryEventLog::new(Duration::from_secs(60))),
            Arc::new(MemoryFlowStore::new()),
            Arc::new(MonitorSet::new()),
        );
        let mut session = Session::new(1, None, false);
        session
            .emit(&tracker, FlowEventKind::AuthCheck, serde_json::json!({}))
            .await;
        session
            .emit(&tracker, FlowEventKind::BlockCheck, serde_json::json!({}))
            .await;
        session
            .emit(&tracker, FlowEventKind::UsageCheck, serde_json::json!({}))
            .await;

        let events = session.events();
        assert!(events[0].parent_id.is_none());
        assert_eq!(events[1].parent_id.as_deref(), Some(events[0].id.as_str()));
        assert_eq!(events[2].parent_id.as_deref(), Some(events[1].id.as_str()));
    }
}
