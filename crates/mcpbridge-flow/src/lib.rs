//! Flow tracking: the short-lived event log, durable flow/audit stores,
//! the monitoring set, the per-session tracker, and the admin broadcaster.

pub mod broadcast;
pub mod eventlog;
pub mod monitor;
pub mod store;
pub mod tracker;

pub use broadcast::Broadcaster;
pub use eventlog::{
    flow_channel, ChannelMessage, EventLog, EventLogError, EventLogResult, MemoryEventLog,
    Subscription, FLOW_PATTERN,
};
pub use monitor::MonitorSet;
pub use store::{
    AuditStore, FlowRecord, FlowStore, MemoryAuditStore, MemoryFlowStore, StoreError, StoreResult,
};
pub use tracker::{FlowPublication, FlowTracker};
