//! Durable storage traits for interaction flows and audit records, with
//! in-memory backends.

use chrono::{DateTime, NaiveDate, Utc};
use mcpbridge_core::{AuditRecord, ConversationId, FlowEvent, SessionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One archived session: the full event list as a single document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub user_id: i64,
    pub flow_data: Vec<FlowEvent>,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait FlowStore: Send + Sync {
    async fn save_flow(&self, record: FlowRecord) -> StoreResult<()>;

    /// Most recent flows for a user, newest first.
    async fn flows_for_user(&self, user_id: i64, limit: usize) -> StoreResult<Vec<FlowRecord>>;

    async fn flow_for_session(&self, session_id: &SessionId) -> StoreResult<Option<FlowRecord>>;
}

#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    async fn record(&self, audit: AuditRecord) -> StoreResult<()>;

    /// Sum of successful audit costs for this user on the given day.
    async fn daily_cost(&self, user_id: i64, day: NaiveDate) -> StoreResult<f64>;

    /// All records for a user, oldest first.
    async fn records_for_user(&self, user_id: i64) -> StoreResult<Vec<AuditRecord>>;
}

/// In-memory flow store keyed by session id.
#[derive(Default)]
pub struct MemoryFlowStore {
    flows: dashmap::DashMap<SessionId, FlowRecord>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl FlowStore for MemoryFlowStore {
    async fn save_flow(&self, record: FlowRecord) -> StoreResult<()> {
        self.flows.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn flows_for_user(&self, user_id: i64, limit: usize) -> StoreResult<Vec<FlowRecord>> {
        let mut records: Vec<FlowRecord> = self
            .flows
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn flow_for_session(&self, session_id: &SessionId) -> StoreResult<Option<FlowRecord>> {
        Ok(self.flows.get(session_id).map(|e| e.value().clone()))
    }
}

/// In-memory audit store: an append-only list under a read/write lock.
#[derive(Default)]
pub struct MemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AuditStore for MemoryAuditStore {
    async fn record(&self, audit: AuditRecord) -> StoreResult<()> {
        self.records.write().push(audit);
        Ok(())
    }

    async fn daily_cost(&self, user_id: i64, day: NaiveDate) -> StoreResult<f64> {
        let sum = self
            .records
            .read()
            .iter()
            .filter(|r| r.user_id == user_id && r.success && r.timestamp.date_naive() == day)
            .map(|r| r.cost)
            .sum();
        Ok(sum)
    }

    async fn records_for_user(&self, user_id: i64) -> StoreResult<Vec<AuditRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }
}
