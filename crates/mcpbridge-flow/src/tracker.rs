//! Flow tracker: event emission into the log, live publication for
//! monitored users, and best-effort archival.

use crate::eventlog::{flow_channel, EventLog};
use crate::monitor::MonitorSet;
use crate::store::{FlowRecord, FlowStore};
use mcpbridge_core::{FlowEvent, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Payload published on a user's flow channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowPublication {
    pub user_id: i64,
    pub session_id: SessionId,
    pub event: FlowEvent,
}

pub struct FlowTracker {
    log: Arc<dyn EventLog>,
    store: Arc<dyn FlowStore>,
    monitor: Arc<MonitorSet>,
}

impl FlowTracker {
    pub fn new(log: Arc<dyn EventLog>, store: Arc<dyn FlowStore>, monitor: Arc<MonitorSet>) -> Self {
        Self {
            log,
            store,
            monitor,
        }
    }

    pub fn monitor(&self) -> &Arc<MonitorSet> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Whether live fan-out is currently enabled for a user. Sessions
    /// freeze this at start.
    pub fn is_monitored(&self, user_id: i64) -> bool {
        self.monitor.is_monitored(user_id)
    }

    /// Append an event to the session stream and, when the session is
    /// monitored, publish it for admin observers. Log failures are
    /// swallowed — tracing must never fail the user request.
    pub async fn record(
        &self,
        user_id: i64,
        session_id: &SessionId,
        monitored: bool,
        event: &FlowEvent,
    ) {
        if let Err(e) = self.log.append(session_id, event).await {
            warn!(%session_id, "event append failed: {e}");
        }
        if monitored {
            let publication = FlowPublication {
                user_id,
                session_id: session_id.clone(),
                event: event.clone(),
            };
            match serde_json::to_value(&publication) {
                Ok(payload) => {
                    if let Err(e) = self.log.publish(&flow_channel(user_id), payload).await {
                        warn!(%session_id, "event publish failed: {e}");
                    }
                }
                Err(e) => warn!("flow publication serialization failed: {e}"),
            }
        }
    }

    /// Archive a completed session's event list. Best-effort: failure is
    /// logged, never surfaced.
    pub async fn archive(&self, record: FlowRecord) {
        let session_id = record.session_id.clone();
        match self.store.save_flow(record).await {
            Ok(()) => debug!(%session_id, "session archived"),
            Err(e) => warn!(%session_id, "archive failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::{MemoryEventLog, FLOW_PATTERN};
    use crate::store::MemoryFlowStore;
    use mcpbridge_core::FlowEventKind;
    use serde_json::json;
    use std::time::Duration;

    fn tracker() -> (FlowTracker, Arc<MemoryEventLog>, Arc<MemoryFlowStore>) {
        let log = Arc::new(MemoryEventLog::new(Duration::from_secs(60)));
        let store = Arc::new(MemoryFlowStore::new());
        let monitor = Arc::new(MonitorSet::new());
        let t = FlowTracker::new(log.clone(), store.clone(), monitor);
        (t, log, store)
    }

    #[tokio::test]
    async fn unmonitored_user_produces_no_publications() {
        let (tracker, log, _) = tracker();
        let mut sub = log.subscribe(FLOW_PATTERN);
        let sid = SessionId::generate();

        let monitored = tracker.is_monitored(9);
        assert!(!monitored);
        tracker
            .record(9, &sid, monitored, &FlowEvent::new(FlowEventKind::AuthCheck, json!({})))
            .await;

        // Appended to the stream, but nothing published.
        assert_eq!(log.read_stream(&sid).await.unwrap().len(), 1);
        log.publish("sentinel", json!({})).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .ok()
            .flatten();
        assert!(msg.is_none());
    }

    #[tokio::test]
    async fn monitored_user_events_reach_subscribers() {
        let (tracker, log, _) = tracker();
        tracker.monitor().enable(7, Duration::from_secs(60));
        let mut sub = log.subscribe(FLOW_PATTERN);
        let sid = SessionId::generate();

        let monitored = tracker.is_monitored(7);
        assert!(monitored);
        tracker
            .record(
                7,
                &sid,
                monitored,
                &FlowEvent::new(FlowEventKind::UsageCheck, json!({"remaining": 5.0})),
            )
            .await;

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "flows:7");
        let publication: FlowPublication = serde_json::from_value(msg.payload).unwrap();
        assert_eq!(publication.user_id, 7);
        assert_eq!(publication.event.kind, FlowEventKind::UsageCheck);
    }

    #[tokio::test]
    async fn archive_is_retrievable() {
        let (tracker, _, store) = tracker();
        let sid = SessionId::generate();
        tracker
            .archive(FlowRecord {
                session_id: sid.clone(),
                conversation_id: None,
                user_id: 7,
                flow_data: vec![FlowEvent::new(FlowEventKind::LlmComplete, json!({}))],
                created_at: chrono::Utc::now(),
            })
            .await;
        assert!(store.flow_for_session(&sid).await.unwrap().is_some());
    }
}
