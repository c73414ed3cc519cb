//! HTTP API integration tests
//!
//! Drives the router directly with `tower::ServiceExt::oneshot` against a
//! temporary SQLite database, no listening socket required.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use simulcast_server::api::{create_router, AppContext};
use tempfile::TempDir;
use tower::ServiceExt;

async fn test_app() -> (Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let db_pool = simulcast_common::db::init_database(&dir.path().join("test.db"))
        .await
        .unwrap();
    let ctx = AppContext {
        db_pool,
        bus: None,
        hub: None,
        resolver: None,
    };
    (create_router(ctx), dir)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn matinee_request(start_at_ms: i64) -> Value {
    json!({
        "slug": "matinee",
        "title": "Saturday Matinee",
        "start_at_ms": start_at_ms,
        "loop_count": 2,
        "items": [
            { "media_id": "vid-a", "duration_secs": 120.0, "access_policy": "public" },
            { "media_id": "vid-b", "duration_secs": 180.0, "access_policy": "signed" }
        ]
    })
}

#[tokio::test]
async fn health_reports_module_and_version() {
    let (app, _dir) = test_app().await;
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["module"], "simulcast_server");
}

#[tokio::test]
async fn server_time_is_current_epoch_millis() {
    let (app, _dir) = test_app().await;
    let before = chrono::Utc::now().timestamp_millis();
    let response = app.oneshot(get("/time")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let now_ms = body["now_ms"].as_i64().unwrap();
    let after = chrono::Utc::now().timestamp_millis();
    assert!(now_ms >= before && now_ms <= after);
}

#[tokio::test]
async fn create_then_get_roundtrip() {
    let (app, _dir) = test_app().await;

    let response = app
        .clone()
        .oneshot(post_json("/broadcasts", matinee_request(1_000_000)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["slug"], "matinee");

    let response = app.oneshot(get("/broadcasts/matinee")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["title"], "Saturday Matinee");
    assert_eq!(body["loop_count"], 2);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["items"][1]["access_policy"], "signed");
}

#[tokio::test]
async fn create_clamps_out_of_range_settings() {
    let (app, _dir) = test_app().await;

    let mut request = matinee_request(0);
    request["loop_count"] = json!(99);
    request["resync_interval_ms"] = json!(100);
    request["drift_tolerance_secs"] = json!(0.1);

    let response = app
        .clone()
        .oneshot(post_json("/broadcasts", request))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(app.oneshot(get("/broadcasts/matinee")).await.unwrap()).await;
    assert_eq!(body["loop_count"], 10);
    assert_eq!(body["resync_interval_ms"], 1_000);
    assert_eq!(body["drift_tolerance_secs"], 1.0);
}

#[tokio::test]
async fn create_without_slug_is_rejected() {
    let (app, _dir) = test_app().await;
    let mut request = matinee_request(0);
    request.as_object_mut().unwrap().remove("slug");

    let response = app.oneshot(post_json("/broadcasts", request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn missing_duration_without_resolver_is_rejected() {
    let (app, _dir) = test_app().await;
    let request = json!({
        "slug": "matinee",
        "start_at_ms": 0,
        "items": [{ "media_id": "vid-a" }]
    });

    let response = app.oneshot(post_json("/broadcasts", request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn unknown_slug_returns_not_found() {
    let (app, _dir) = test_app().await;
    for uri in [
        "/broadcasts/ghost",
        "/broadcasts/ghost/status",
        "/broadcasts/ghost/timeline",
        "/broadcasts/ghost/events",
    ] {
        let response = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn stop_persists_and_resume_clears() {
    let (app, _dir) = test_app().await;
    app.clone()
        .oneshot(post_json("/broadcasts", matinee_request(0)))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json("/broadcasts/matinee/stop", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let status = body_json(app.clone().oneshot(get("/broadcasts/matinee/status")).await.unwrap()).await;
    assert!(status["forced_stop_at_ms"].as_i64().is_some());

    app.clone()
        .oneshot(post_json("/broadcasts/matinee/resume", json!({})))
        .await
        .unwrap();
    let status = body_json(app.oneshot(get("/broadcasts/matinee/status")).await.unwrap()).await;
    assert!(status["forced_stop_at_ms"].is_null());
}

#[tokio::test]
async fn status_endpoint_is_briefly_cacheable() {
    let (app, _dir) = test_app().await;
    app.clone()
        .oneshot(post_json("/broadcasts", matinee_request(0)))
        .await
        .unwrap();

    let response = app.oneshot(get("/broadcasts/matinee/status")).await.unwrap();
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "public, max-age=5"
    );
}

#[tokio::test]
async fn timeline_is_never_cached() {
    let (app, _dir) = test_app().await;
    app.clone()
        .oneshot(post_json("/broadcasts", matinee_request(0)))
        .await
        .unwrap();

    let response = app.oneshot(get("/broadcasts/matinee/timeline")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    let body = body_json(response).await;
    // Started at epoch 0, so the playlist has long since ended
    assert_eq!(body["phase"], "ended");
}

#[tokio::test]
async fn timeline_counts_down_before_start() {
    let (app, _dir) = test_app().await;
    let start = chrono::Utc::now().timestamp_millis() + 3_600_000;
    app.clone()
        .oneshot(post_json("/broadcasts", matinee_request(start)))
        .await
        .unwrap();

    let body = body_json(app.oneshot(get("/broadcasts/matinee/timeline")).await.unwrap()).await;
    assert_eq!(body["phase"], "countdown");
    let until = body["seconds_until_start"].as_f64().unwrap();
    assert!(until > 3_590.0 && until <= 3_600.0);
}

#[tokio::test]
async fn events_returns_unavailable_when_fanout_is_unconfigured() {
    let (app, _dir) = test_app().await;
    let start = chrono::Utc::now().timestamp_millis() + 3_600_000;
    app.clone()
        .oneshot(post_json("/broadcasts", matinee_request(start)))
        .await
        .unwrap();

    // hub is None in the test context, so a live broadcast cannot stream
    let response = app.oneshot(get("/broadcasts/matinee/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn events_on_stopped_broadcast_is_a_terminal_stream() {
    let (app, _dir) = test_app().await;
    app.clone()
        .oneshot(post_json("/broadcasts", matinee_request(0)))
        .await
        .unwrap();
    app.clone()
        .oneshot(post_json("/broadcasts/matinee/stop", json!({})))
        .await
        .unwrap();

    // No registration happens on this path, so the body is finite and can
    // be collected even without a hub.
    let response = app.oneshot(get("/broadcasts/matinee/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("event: stopped"));
    assert!(text.contains("\"slug\":\"matinee\""));
}

#[tokio::test]
async fn delete_removes_the_broadcast() {
    let (app, _dir) = test_app().await;
    app.clone()
        .oneshot(post_json("/broadcasts", matinee_request(0)))
        .await
        .unwrap();

    let request = Request::builder()
        .method("DELETE")
        .uri("/broadcasts/matinee")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/broadcasts/matinee")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn update_replaces_playlist_and_preserves_forced_stop() {
    let (app, _dir) = test_app().await;
    app.clone()
        .oneshot(post_json("/broadcasts", matinee_request(0)))
        .await
        .unwrap();
    app.clone()
        .oneshot(post_json("/broadcasts/matinee/stop", json!({})))
        .await
        .unwrap();

    let mut request = matinee_request(5_000);
    request["items"] = json!([
        { "media_id": "vid-c", "duration_secs": 60.0, "access_policy": "public" }
    ]);
    let put = Request::builder()
        .method("PUT")
        .uri("/broadcasts/matinee")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(request.to_string()))
        .unwrap();
    let response = app.clone().oneshot(put).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(app.clone().oneshot(get("/broadcasts/matinee")).await.unwrap()).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["items"][0]["media_id"], "vid-c");

    // An edit does not silently un-stop a force-stopped broadcast
    let status = body_json(app.oneshot(get("/broadcasts/matinee/status")).await.unwrap()).await;
    assert!(status["forced_stop_at_ms"].as_i64().is_some());
}
