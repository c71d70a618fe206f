//! Server assembly: dependency wiring, background tasks, and the axum
//! router.

use crate::state::AppState;
use crate::{admin, monitoring, sse, ws};
use axum::routing::{get, post};
use axum::Router;
use mcpbridge_core::BridgeConfig;
use mcpbridge_engine::users::RolePolicy;
use mcpbridge_engine::{ChatEngine, EngineDeps, MemoryUserDirectory};
use mcpbridge_flow::{
    AuditStore, Broadcaster, EventLog, FlowStore, FlowTracker, MemoryAuditStore, MemoryEventLog,
    MemoryFlowStore, MonitorSet,
};
use mcpbridge_guard::{BehaviorTracker, GuardMediator};
use mcpbridge_llm::{AnthropicProvider, LlmProvider};
use mcpbridge_mcp::{HttpMcpTransport, McpCoordinator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Default daily limits per role when the config doesn't say otherwise.
const ROLE_LIMITS: &[(&str, f64)] = &[
    ("super_admin", 1000.0),
    ("admin", 500.0),
    ("user", 100.0),
];

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/chat", get(ws::chat_ws_handler))
        .route("/ask/stream", post(sse::ask_stream_handler))
        .route("/ws/admin", get(admin::admin_ws_handler))
        .route(
            "/monitoring/enable/:user",
            post(monitoring::enable_monitoring),
        )
        .route(
            "/monitoring/disable/:user",
            post(monitoring::disable_monitoring),
        )
        .route("/monitoring/list", get(monitoring::list_monitoring))
        .route(
            "/monitoring/flows/session/:session",
            get(monitoring::flow_for_session),
        )
        .route("/monitoring/flows/:user", get(monitoring::flows_for_user))
        .route("/health", get(monitoring::health))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_gateway(config: BridgeConfig, api_key: String) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let transport = Arc::new(HttpMcpTransport::new(
        Duration::from_secs(config.coordinator.dispatch_timeout_seconds),
        Duration::from_secs(config.coordinator.health_timeout_seconds),
    ));
    let coordinator = Arc::new(McpCoordinator::new(&config, transport));

    let log = Arc::new(MemoryEventLog::new(Duration::from_secs(
        config.flow.default_ttl_hours * 3600,
    )));
    let flow_store = Arc::new(MemoryFlowStore::new());
    let audit_store = Arc::new(MemoryAuditStore::new());
    let monitor = Arc::new(MonitorSet::new());
    let tracker = Arc::new(FlowTracker::new(
        log.clone() as Arc<dyn EventLog>,
        flow_store.clone() as Arc<dyn FlowStore>,
        monitor.clone(),
    ));

    let directory = Arc::new(MemoryUserDirectory::new(RolePolicy {
        allowed_mcps: coordinator.available_mcps(),
        daily_limit: 100.0,
    }));
    for (role, limit) in ROLE_LIMITS {
        directory.set_role_policy(
            *role,
            RolePolicy {
                allowed_mcps: coordinator.available_mcps(),
                daily_limit: *limit,
            },
        );
    }

    let guard = Arc::new(GuardMediator::new(
        log.clone() as Arc<dyn EventLog>,
        config.prompt_guard.clone(),
    ));
    let behavior = Arc::new(BehaviorTracker::new(config.prompt_guard.clone()));

    let provider: Arc<dyn LlmProvider> = Arc::new(AnthropicProvider::new(
        api_key,
        Duration::from_secs(config.llm.request_timeout_seconds),
    ));

    let engine = Arc::new(ChatEngine::new(
        EngineDeps {
            provider,
            coordinator: coordinator.clone(),
            tracker,
            audit: audit_store.clone() as Arc<dyn AuditStore>,
            directory: directory.clone(),
            guard: guard.clone(),
            behavior,
        },
        &config,
    ));

    let broadcaster = Arc::new(Broadcaster::new(config.flow.observer_queue_depth));

    // Background tasks, all stopped by the shutdown watch channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    coordinator.spawn_prober(shutdown_rx.clone());
    coordinator.spawn_cache_evictor(Duration::from_secs(60), shutdown_rx.clone());
    guard.spawn_reply_pump(shutdown_rx.clone());
    broadcaster.spawn_pump(log.clone() as Arc<dyn EventLog>, shutdown_rx.clone());

    // Sweep expired event-log streams; durable archives outlive them.
    tokio::spawn({
        let log = log.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = ticker.tick() => log.purge_expired(),
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    });

    // Bridge MCP health transitions into the observer fan-out.
    tokio::spawn({
        let broadcaster = broadcaster.clone();
        let mut status_rx = coordinator.subscribe_status();
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            loop {
                tokio::select! {
                    change = status_rx.recv() => match change {
                        Ok(change) => broadcaster.dispatch_status(&change.mcp, change.healthy),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    });

    let state = Arc::new(AppState {
        engine,
        coordinator,
        broadcaster,
        monitor,
        flows: flow_store as Arc<dyn FlowStore>,
        config: config.clone(),
    });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("mcpbridge v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);
    info!("  chat:    ws://{addr}/ws/chat");
    info!("  oneshot: POST http://{addr}/ask/stream");
    info!("  admin:   ws://{addr}/ws/admin");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
