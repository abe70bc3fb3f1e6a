//! HTTP transport surface: request/response endpoints plus a server-sent
//! event stream bridging the local event fabric to external observers.

mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::Result;
use crate::orchestrator::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route(
            "/workers",
            get(handlers::list_workers).post(handlers::spawn_workers),
        )
        .route(
            "/workers/:id",
            get(handlers::get_worker).delete(handlers::terminate_worker),
        )
        .route("/workers/:id/logs", get(handlers::worker_logs))
        .route("/workers/:id/stats", get(handlers::worker_stats))
        .route("/workers/:id/send", post(handlers::send_to_worker))
        .route("/messages", post(handlers::send_message))
        .route("/messages/broadcast", post(handlers::broadcast_message))
        .route("/messages/report", get(handlers::queue_report))
        .route("/worktrees", get(handlers::list_worktrees))
        .route("/worktrees/:worker_id/diff", get(handlers::worktree_diff))
        .route(
            "/consolidations",
            get(handlers::list_consolidations).post(handlers::create_consolidation),
        )
        .route(
            "/consolidations/:id",
            get(handlers::get_consolidation).delete(handlers::delete_consolidation),
        )
        .route(
            "/consolidations/:id/analyze",
            post(handlers::analyze_consolidation),
        )
        .route(
            "/consolidations/:id/resolve",
            post(handlers::resolve_consolidation),
        )
        .route(
            "/consolidations/:id/export",
            post(handlers::export_consolidation),
        )
        .route("/barriers", post(handlers::create_barrier))
        .route("/barriers/:id/signal", post(handlers::signal_barrier))
        .route("/elections", post(handlers::conduct_election))
        .route("/elections/:id/vote", post(handlers::cast_vote))
        .route("/partitions", post(handlers::partition))
        .route("/events", get(handlers::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the process is interrupted; the caller owns engine shutdown.
pub async fn serve(engine: Arc<Engine>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %bind, "Transport surface listening");
    axum::serve(listener, router(engine))
        .await
        .map_err(|e| crate::error::MusterError::Internal(e.to_string()))?;
    Ok(())
}
