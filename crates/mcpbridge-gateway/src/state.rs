//! Shared application state handed to every handler.

use mcpbridge_core::BridgeConfig;
use mcpbridge_engine::ChatEngine;
use mcpbridge_flow::{Broadcaster, FlowStore, MonitorSet};
use mcpbridge_mcp::McpCoordinator;
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<ChatEngine>,
    pub coordinator: Arc<McpCoordinator>,
    pub broadcaster: Arc<Broadcaster>,
    pub monitor: Arc<MonitorSet>,
    pub flows: Arc<dyn FlowStore>,
    pub config: Arc<BridgeConfig>,
}
