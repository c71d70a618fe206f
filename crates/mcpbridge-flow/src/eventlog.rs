//! Event log abstraction: append-to-stream keyed by session id,
//! publish-to-channel, and pattern-subscribe.
//!
//! The in-memory backend is the only one built here; the trait is the seam
//! for an external log. Stream retention is TTL-bounded — durable archives
//! in the flow store are the authoritative long-term record.

use mcpbridge_core::{FlowEvent, SessionId};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Channel carrying flow publications for one user.
pub fn flow_channel(user_id: i64) -> String {
    format!("flows:{user_id}")
}

/// Pattern matching every flow channel.
pub const FLOW_PATTERN: &str = "flows:*";

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("event log error: {0}")]
    Backend(String),
}

pub type EventLogResult<T> = Result<T, EventLogError>;

/// A message published on a named channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: Value,
}

/// A pattern-filtered subscription over the publish bus.
pub struct Subscription {
    pattern: String,
    rx: broadcast::Receiver<ChannelMessage>,
}

impl Subscription {
    /// Next message whose channel matches the pattern. `None` when the log
    /// shuts down. Lagged slots are skipped.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if pattern_matches(&self.pattern, &msg.channel) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(pattern = %self.pattern, "subscription lagged, skipped {n}");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Trailing-`*` glob, exact match otherwise.
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to a per-session stream.
    async fn append(&self, session_id: &SessionId, event: &FlowEvent) -> EventLogResult<()>;

    /// Read a session's stream, oldest first. Empty when expired or unknown.
    async fn read_stream(&self, session_id: &SessionId) -> EventLogResult<Vec<FlowEvent>>;

    /// Publish a payload on a named channel.
    async fn publish(&self, channel: &str, payload: Value) -> EventLogResult<()>;

    /// Subscribe to channels matching a pattern.
    fn subscribe(&self, pattern: &str) -> Subscription;
}

struct StreamEntry {
    events: Vec<FlowEvent>,
    created_at: Instant,
}

/// In-memory event log with TTL-bounded streams.
pub struct MemoryEventLog {
    streams: dashmap::DashMap<SessionId, StreamEntry>,
    ttl: Duration,
    publish_tx: broadcast::Sender<ChannelMessage>,
}

impl MemoryEventLog {
    pub fn new(ttl: Duration) -> Self {
        let (publish_tx, _) = broadcast::channel(1024);
        Self {
            streams: dashmap::DashMap::new(),
            ttl,
            publish_tx,
        }
    }

    /// Drop streams past their retention.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.streams.retain(|_, entry| entry.created_at.elapsed() <= ttl);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, session_id: &SessionId, event: &FlowEvent) -> EventLogResult<()> {
        self.streams
            .entry(session_id.clone())
            .or_insert_with(|| StreamEntry {
                events: Vec::new(),
                created_at: Instant::now(),
            })
            .events
            .push(event.clone());
        Ok(())
    }

    async fn read_stream(&self, session_id: &SessionId) -> EventLogResult<Vec<FlowEvent>> {
        match self.streams.get(session_id) {
            Some(entry) if entry.created_at.elapsed() <= self.ttl => Ok(entry.events.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn publish(&self, channel: &str, payload: Value) -> EventLogResult<()> {
        // No subscribers is fine — publishing is fire-and-forget.
        let _ = self.publish_tx.send(ChannelMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.publish_tx.subscribe(),
        }
    }
}
