//! HTTP server setup and routing

use crate::config::ServerConfig;
use crate::fanout::FanoutHub;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use simulcast_common::events::ControlBus;
use simulcast_common::media::MediaResolver;
use simulcast_common::Result;
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub db_pool: SqlitePool,
    /// Publish side of the control-event channel. `None` when the medium
    /// is unconfigured; mutations then rely on durable state alone.
    pub bus: Option<ControlBus>,
    /// Fan-out hub for this process. `None` when the medium is
    /// unconfigured; the SSE endpoint then fails fast with 503.
    pub hub: Option<Arc<FanoutHub>>,
    /// Asset-provider collaborator for durations at create/edit time.
    /// `None` means callers must supply durations inline.
    pub resolver: Option<Arc<dyn MediaResolver>>,
}

/// Build the router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        // Health endpoint
        .route("/health", get(super::handlers::health))
        // Authoritative time source for client clock calibration
        .route("/time", get(super::handlers::server_time))
        // Schedule mutations (administrative)
        .route("/broadcasts", post(super::handlers::create_broadcast))
        .route("/broadcasts", get(super::handlers::list_broadcasts))
        .route("/broadcasts/:slug", get(super::handlers::get_broadcast))
        .route("/broadcasts/:slug", put(super::handlers::update_broadcast))
        .route("/broadcasts/:slug", delete(super::handlers::delete_broadcast))
        .route("/broadcasts/:slug/stop", post(super::handlers::stop_broadcast))
        .route("/broadcasts/:slug/resume", post(super::handlers::resume_broadcast))
        // Viewer-facing reads
        .route("/broadcasts/:slug/status", get(super::handlers::broadcast_status))
        .route("/broadcasts/:slug/timeline", get(super::handlers::broadcast_timeline))
        // SSE push stream for control events
        .route("/broadcasts/:slug/events", get(super::sse::viewer_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Run the HTTP server for one worker process
pub async fn run(config: &ServerConfig, port: u16, ctx: AppContext) -> Result<()> {
    let hub = ctx.hub.clone();
    let app = create_router(ctx);

    let addr: SocketAddr = format!("{}:{}", config.host, port)
        .parse()
        .map_err(|e| simulcast_common::Error::Config(format!("invalid bind address: {e}")))?;

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Long-lived SSE connections must not block shutdown indefinitely:
    // cancel the hub first so streams end, then let axum drain.
    let shutdown = async move {
        shutdown_signal().await;
        if let Some(hub) = hub {
            hub.shutdown();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| simulcast_common::Error::Internal(format!("server error: {e}")))?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
