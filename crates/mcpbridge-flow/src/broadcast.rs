//! Admin broadcaster: fan-out of published flow events to observer
//! sockets, filtered per subscription, with bounded per-observer queues.
//!
//! Fan-out never blocks: a full observer queue drops the observer.

use crate::eventlog::{EventLog, FLOW_PATTERN};
use crate::tracker::FlowPublication;
use mcpbridge_core::protocol::{AdminServerFrame, ObserverFilter};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

struct Observer {
    filter: ObserverFilter,
    tx: mpsc::Sender<AdminServerFrame>,
}

pub struct Broadcaster {
    observers: dashmap::DashMap<String, Observer>,
    queue_depth: usize,
}

impl Broadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            observers: dashmap::DashMap::new(),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register an observer. The returned receiver feeds its socket; the
    /// previous registration under the same id (if any) is replaced.
    pub fn subscribe(
        &self,
        observer_id: impl Into<String>,
        filter: ObserverFilter,
    ) -> mpsc::Receiver<AdminServerFrame> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.observers
            .insert(observer_id.into(), Observer { filter, tx });
        rx
    }

    pub fn update_filter(&self, observer_id: &str, filter: ObserverFilter) {
        if let Some(mut observer) = self.observers.get_mut(observer_id) {
            observer.filter = filter;
        }
    }

    /// Remove an observer; queued frames for it are discarded with the
    /// receiver.
    pub fn unsubscribe(&self, observer_id: &str) {
        self.observers.remove(observer_id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Fan a flow publication out to every matching observer.
    pub fn dispatch_flow(&self, publication: &FlowPublication) {
        let mut dropped: Vec<String> = Vec::new();
        for entry in self.observers.iter() {
            if !entry
                .filter
                .matches(publication.user_id, &publication.event)
            {
                continue;
            }
            let frame = AdminServerFrame::FlowEvent {
                user_id: publication.user_id,
                session_id: publication.session_id.to_string(),
                event: publication.event.clone(),
            };
            if entry.tx.try_send(frame).is_err() {
                dropped.push(entry.key().clone());
            }
        }
        for id in dropped {
            warn!(observer = %id, "dropping slow or disconnected observer");
            self.observers.remove(&id);
        }
    }

    /// Broadcast an MCP health transition to every observer.
    pub fn dispatch_status(&self, mcp: &str, healthy: bool) {
        let mut dropped: Vec<String> = Vec::new();
        for entry in self.observers.iter() {
            let frame = AdminServerFrame::McpStatusChange {
                mcp: mcp.to_string(),
                healthy,
            };
            if entry.tx.try_send(frame).is_err() {
                dropped.push(entry.key().clone());
            }
        }
        for id in dropped {
            warn!(observer = %id, "dropping slow or disconnected observer");
            self.observers.remove(&id);
        }
    }

    /// Pump task: drain the event log's flow channels into observers.
    pub fn spawn_pump(
        self: &Arc<Self>,
        log: Arc<dyn EventLog>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut subscription = log.subscribe(FLOW_PATTERN);
            info!("broadcaster pump started");
            loop {
                tokio::select! {
                    msg = subscription.recv() => match msg {
                        Some(msg) => match serde_json::from_value::<FlowPublication>(msg.payload) {
                            Ok(publication) => broadcaster.dispatch_flow(&publication),
                            Err(e) => warn!("malformed flow publication: {e}"),
                        },
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("broadcaster pump stopped");
        })
    }
}
