//! Viewer push stream (Server-Sent Events)
//!
//! A connecting viewer first gets a synchronous durable-state check: if
//! the broadcast is already stopped, the terminal event is delivered
//! immediately and the stream ends without any registration. Otherwise the
//! connection joins this process's fan-out registry and receives control
//! events plus heartbeat comments until it disconnects or the broadcast
//! stops.

use crate::api::handlers::ApiError;
use crate::api::server::AppContext;
use crate::fanout::Frame;
use axum::{
    extract::{Path, State},
    http::header,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use chrono::TimeZone;
use futures::stream::Stream;
use simulcast_common::events::{ControlEvent, ControlKind};
use simulcast_common::{db, Error};
use std::convert::Infallible;
use std::pin::Pin;
use tracing::{debug, warn};

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// GET /broadcasts/:slug/events - SSE control-event stream
pub async fn viewer_events(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let status = db::get_status(&ctx.db_pool, &slug)
        .await?
        .ok_or_else(|| Error::NotFound(format!("broadcast: {slug}")))?;

    // Already stopped: deliver the terminal event and close, skipping the
    // subscription entirely.
    if status.is_stopped() {
        debug!("Viewer connected to already-stopped '{}', terminal reply", slug);
        return Ok(sse_response(terminal_stream(slug, status.forced_stop_at_ms)));
    }

    // The fan-out medium being unconfigured is fatal for this connection
    // attempt: fail fast so the client switches to polling, never hang.
    let hub = ctx.hub.as_ref().ok_or_else(|| {
        Error::Unavailable("control event stream is not configured on this server".into())
    })?;

    let mut registration = hub.register(&slug);
    debug!("Viewer stream open for '{}'", slug);

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("connected")
            .data(format!("{{\"slug\":\"{slug}\"}}")));

        loop {
            tokio::select! {
                _ = registration.cancel.cancelled() => break,
                frame = registration.rx.recv() => match frame {
                    Some(Frame::Named { event, data }) => {
                        yield Ok(Event::default().event(event).data(data));
                    }
                    Some(Frame::Comment(comment)) => {
                        yield Ok(Event::default().comment(comment));
                    }
                    None => break,
                },
            }
        }
        // registration (and its guard) drops here, deregistering the
        // connection on every exit path
    };

    Ok(sse_response(Box::pin(stream)))
}

/// Single terminal `stopped` event, then end of stream
fn terminal_stream(slug: String, forced_stop_at_ms: Option<i64>) -> EventStream {
    let timestamp = forced_stop_at_ms
        .and_then(|ms| chrono::Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(chrono::Utc::now);
    let event = ControlEvent {
        kind: ControlKind::Stopped,
        slug,
        timestamp,
        payload: serde_json::Value::Null,
    };
    let data = serde_json::to_string(&event).unwrap_or_else(|e| {
        warn!("Failed to serialize terminal event: {}", e);
        "{}".to_string()
    });
    Box::pin(async_stream::stream! {
        yield Ok(Event::default().event("stopped").data(data));
    })
}

/// Wrap a stream as an SSE response with buffering disabled.
///
/// Heartbeats come from the fan-out hub's shared per-process timer as
/// comment frames, not from a per-connection keep-alive.
fn sse_response(stream: EventStream) -> Response {
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream),
    )
        .into_response()
}
