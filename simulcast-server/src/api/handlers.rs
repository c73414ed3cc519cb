//! HTTP request handlers
//!
//! Schedule mutations persist first, then publish the control event; the
//! polling endpoint serves durable state with a very short cache TTL so
//! fallback clients converge within seconds.

use crate::api::server::AppContext;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use simulcast_common::model::{
    AccessPolicy, BroadcastSchedule, BroadcastStatus, PlaylistItem,
};
use simulcast_common::events::ControlEvent;
use simulcast_common::timeline::TimelineState;
use simulcast_common::{db, time, timeline, Error};
use tracing::{error, info};
use uuid::Uuid;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    status: String,
}

#[derive(Debug, Serialize)]
pub struct ServerTimeResponse {
    pub now_ms: i64,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistItemRequest {
    pub media_id: String,
    /// When absent, resolved through the media collaborator
    pub duration_secs: Option<f64>,
    pub access_policy: Option<AccessPolicy>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub slug: Option<String>,
    pub title: Option<String>,
    pub start_at_ms: i64,
    #[serde(default = "default_loop_count")]
    pub loop_count: u32,
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance_secs: f64,
    #[serde(default = "default_resync_interval")]
    pub resync_interval_ms: u64,
    #[serde(default = "default_active")]
    pub active: bool,
    pub items: Vec<PlaylistItemRequest>,
}

fn default_loop_count() -> u32 {
    1
}
fn default_drift_tolerance() -> f64 {
    5.0
}
fn default_resync_interval() -> u64 {
    5_000
}
fn default_active() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct CreateBroadcastResponse {
    pub id: Uuid,
    pub slug: String,
}

// ============================================================================
// Error mapping
// ============================================================================

/// Maps common errors to HTTP status codes with a JSON body
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(StatusResponse {
                status: format!("error: {}", self.0),
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Health and time endpoints
// ============================================================================

/// GET /health - Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "simulcast_server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /time - Authoritative server time for client clock calibration
pub async fn server_time() -> Json<ServerTimeResponse> {
    Json(ServerTimeResponse {
        now_ms: time::now_ms(),
    })
}

// ============================================================================
// Schedule mutations
// ============================================================================

/// POST /broadcasts - Create a broadcast with its full playlist
pub async fn create_broadcast(
    State(ctx): State<AppContext>,
    Json(request): Json<BroadcastRequest>,
) -> Result<(StatusCode, Json<CreateBroadcastResponse>), ApiError> {
    let slug = request
        .slug
        .clone()
        .ok_or_else(|| Error::InvalidInput("slug is required".into()))?;

    let schedule = build_schedule(&ctx, slug.clone(), request).await?;
    db::create_broadcast(&ctx.db_pool, &schedule).await?;
    info!("Created broadcast '{}' ({} items)", slug, schedule.items.len());

    Ok((
        StatusCode::CREATED,
        Json(CreateBroadcastResponse {
            id: schedule.id,
            slug,
        }),
    ))
}

/// PUT /broadcasts/:slug - Update a broadcast, replacing the playlist
pub async fn update_broadcast(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let mut schedule = build_schedule(&ctx, slug.clone(), request).await?;
    // Preserve the stored id; the slug addresses the row
    if let Some(existing) = db::get_broadcast(&ctx.db_pool, &slug).await? {
        schedule.id = existing.id;
        schedule.forced_stop_at_ms = existing.forced_stop_at_ms;
    }
    db::update_broadcast(&ctx.db_pool, &schedule).await?;
    info!("Updated broadcast '{}'", slug);

    Ok(Json(StatusResponse {
        status: "updated".to_string(),
    }))
}

/// DELETE /broadcasts/:slug
pub async fn delete_broadcast(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    db::delete_broadcast(&ctx.db_pool, &slug).await?;
    info!("Deleted broadcast '{}'", slug);
    Ok(Json(StatusResponse {
        status: "deleted".to_string(),
    }))
}

/// POST /broadcasts/:slug/stop - Force-stop: persist the flag, then publish
pub async fn stop_broadcast(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let stopped_at = time::now_ms();
    db::set_forced_stop(&ctx.db_pool, &slug, Some(stopped_at)).await?;
    info!("Force-stopped broadcast '{}'", slug);

    if let Some(bus) = &ctx.bus {
        bus.publish_lossy(ControlEvent::stopped(slug));
    }

    Ok(Json(StatusResponse {
        status: "stopped".to_string(),
    }))
}

/// POST /broadcasts/:slug/resume - Clear the flag, then publish
pub async fn resume_broadcast(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    db::set_forced_stop(&ctx.db_pool, &slug, None).await?;
    info!("Resumed broadcast '{}'", slug);

    if let Some(bus) = &ctx.bus {
        bus.publish_lossy(ControlEvent::resumed(slug));
    }

    Ok(Json(StatusResponse {
        status: "resumed".to_string(),
    }))
}

// ============================================================================
// Viewer-facing reads
// ============================================================================

/// GET /broadcasts - List broadcast statuses
pub async fn list_broadcasts(
    State(ctx): State<AppContext>,
) -> Result<Json<Vec<BroadcastStatus>>, ApiError> {
    Ok(Json(db::list_broadcasts(&ctx.db_pool).await?))
}

/// GET /broadcasts/:slug - Full schedule with playlist
pub async fn get_broadcast(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
) -> Result<Json<BroadcastSchedule>, ApiError> {
    let schedule = db::get_broadcast(&ctx.db_pool, &slug)
        .await?
        .ok_or_else(|| Error::NotFound(format!("broadcast: {slug}")))?;
    Ok(Json(schedule))
}

/// GET /broadcasts/:slug/status - Polling endpoint for fallback clients.
///
/// Cheap and cacheable with a very short TTL.
pub async fn broadcast_status(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = db::get_status(&ctx.db_pool, &slug)
        .await?
        .ok_or_else(|| Error::NotFound(format!("broadcast: {slug}")))?;
    Ok((
        [(header::CACHE_CONTROL, "public, max-age=5")],
        Json(status),
    ))
}

/// GET /broadcasts/:slug/timeline - Computed timeline state.
///
/// Derived fresh from (now, schedule) on every request; never cached
/// server-side as authoritative.
pub async fn broadcast_timeline(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = db::get_broadcast(&ctx.db_pool, &slug)
        .await?
        .ok_or_else(|| Error::NotFound(format!("broadcast: {slug}")))?;
    let state: TimelineState = timeline::evaluate(time::now_ms(), &schedule);
    Ok(([(header::CACHE_CONTROL, "no-store")], Json(state)))
}

// ============================================================================
// Helpers
// ============================================================================

/// Materialize a schedule from a request, resolving durations through the
/// media collaborator where the request left them out.
async fn build_schedule(
    ctx: &AppContext,
    slug: String,
    request: BroadcastRequest,
) -> Result<BroadcastSchedule, Error> {
    let mut items = Vec::with_capacity(request.items.len());
    for (position, item) in request.items.into_iter().enumerate() {
        let (duration_secs, access_policy) = match (item.duration_secs, item.access_policy) {
            (Some(duration), Some(policy)) => (duration, policy),
            (duration, policy) => {
                let resolver = ctx.resolver.as_ref().ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "item '{}' has no duration and no media resolver is configured",
                        item.media_id
                    ))
                })?;
                let resolved = resolver.resolve(&item.media_id).await?;
                (
                    duration.unwrap_or(resolved.duration_secs),
                    policy.unwrap_or(resolved.access_policy),
                )
            }
        };
        items.push(PlaylistItem {
            id: Uuid::new_v4(),
            media_id: item.media_id,
            access_policy,
            duration_secs,
            position: position as u32,
        });
    }

    Ok(BroadcastSchedule {
        id: Uuid::new_v4(),
        slug,
        title: request.title.unwrap_or_default(),
        start_at_ms: request.start_at_ms,
        items,
        loop_count: request.loop_count,
        drift_tolerance_secs: request.drift_tolerance_secs,
        resync_interval_ms: request.resync_interval_ms,
        forced_stop_at_ms: None,
        active: request.active,
    })
}
