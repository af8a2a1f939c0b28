// ============================================================================
// Streaming Endpoint Tests
// ============================================================================

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use fanout_bus::{engine::ManualEngine, pipeline::PipelineOptions};
use http_body_util::BodyExt;
use tower::ServiceExt;

use crate::{api::app_router, config::Registry, manager::StreamManager};

const REGISTRY: &str = r#"{
    "resources": {
        "track.wav": { "source": "/music/track.flac", "profile": "wav" },
        "clip.mp4": { "source": "http://media/clip.mp4", "profile": "mp4", "shared": false },
        "cam.ts": { "source": "rtsp://cam/1", "profile": "mpegts" }
    }
}"#;

fn app() -> (Router, Arc<ManualEngine>) {
    let engine = ManualEngine::new();
    let manager = StreamManager::new(
        engine.clone(),
        Registry::from_json(REGISTRY).unwrap(),
        PipelineOptions::default(),
    );
    (app_router(Arc::new(manager)), engine)
}

fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(body: Body) -> Vec<u8> {
    body.collect().await.unwrap().to_bytes().to_vec()
}

// ------------------------------------------------------------------------
// GET Tests
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_get_streams_pipeline_output() {
    let (app, engine) = app();
    let response = app
        .oneshot(request(Method::GET, "/stream/track.wav"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/x-wav");

    let feed = engine.take_feed().unwrap();
    feed.header(&b"RIFF"[..]).await;
    feed.chunk(&b"pcm-1"[..]).await;
    feed.chunk(&b"pcm-2"[..]).await;
    feed.eos().await;

    assert_eq!(body_bytes(response.into_body()).await, b"RIFFpcm-1pcm-2");
}

#[tokio::test]
async fn test_concurrent_gets_share_one_pipeline() {
    let (app, engine) = app();
    let first = app
        .clone()
        .oneshot(request(Method::GET, "/stream/track.wav"))
        .await
        .unwrap();
    let second = app
        .clone()
        .oneshot(request(Method::GET, "/stream/track.wav/part/2"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(engine.launch_count(), 1);

    let feed = engine.take_feed().unwrap();
    feed.header(&b"h1"[..]).await;
    feed.chunk(&b"p1"[..]).await;
    feed.chunk(&b"p2"[..]).await;
    feed.eos().await;

    assert_eq!(body_bytes(first.into_body()).await, b"h1p1p2");
    assert_eq!(body_bytes(second.into_body()).await, b"h1p1p2");
}

#[tokio::test]
async fn test_exclusive_resource_per_request() {
    let (app, engine) = app();
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/stream/clip.mp4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    }
    assert_eq!(engine.launch_count(), 2);
}

#[tokio::test]
async fn test_engine_error_aborts_body() {
    let (app, engine) = app();
    let response = app
        .oneshot(request(Method::GET, "/stream/track.wav"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let feed = engine.take_feed().unwrap();
    feed.chunk(&b"c1"[..]).await;
    feed.error("decoder failed").await;

    assert!(response.into_body().collect().await.is_err());
}

#[tokio::test]
async fn test_unknown_resource_is_404() {
    let (app, engine) = app();
    let response = app
        .oneshot(request(Method::GET, "/stream/missing.wav"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(engine.launch_count(), 0);
}

#[tokio::test]
async fn test_unsupported_source_is_500() {
    let (app, engine) = app();
    let response = app
        .oneshot(request(Method::GET, "/stream/cam.ts"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(engine.launch_count(), 0);
}

#[tokio::test]
async fn test_build_failure_is_500() {
    let (app, engine) = app();
    engine.reject_next("no such element");
    let response = app
        .oneshot(request(Method::GET, "/stream/track.wav"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = String::from_utf8(body_bytes(response.into_body()).await).unwrap();
    assert!(body.contains("no such element"));
}

#[tokio::test]
async fn test_attach_errors_map_to_503() {
    use axum::response::IntoResponse;
    use fanout_bus::TranscodeError;

    use crate::handler::ApiError;

    for err in [
        TranscodeError::Terminated,
        TranscodeError::ClientQueueFull { chunks: 2 },
    ] {
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
    let response = ApiError::from(TranscodeError::build("bad topology")).into_response();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

// ------------------------------------------------------------------------
// HEAD Tests
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_head_has_no_pipeline_side_effects() {
    let (app, engine) = app();
    let response = app
        .clone()
        .oneshot(request(Method::HEAD, "/stream/track.wav"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/x-wav");
    assert!(body_bytes(response.into_body()).await.is_empty());

    let nested = app
        .oneshot(request(Method::HEAD, "/stream/clip.mp4/child"))
        .await
        .unwrap();
    assert_eq!(nested.headers()[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(engine.launch_count(), 0);
}

#[tokio::test]
async fn test_head_unknown_is_404() {
    let (app, _engine) = app();
    let response = app
        .oneshot(request(Method::HEAD, "/stream/missing"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ------------------------------------------------------------------------
// Pipe listing Tests
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_pipe_list_and_status() {
    let (app, _engine) = app();
    let _stream = app
        .clone()
        .oneshot(request(Method::GET, "/stream/track.wav"))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/pipe/list"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let list: serde_json::Value =
        serde_json::from_slice(&body_bytes(response.into_body()).await).unwrap();
    assert_eq!(list.as_array().map(Vec::len), Some(1));
    assert_eq!(list[0]["resource"], "track.wav");

    let status = app
        .clone()
        .oneshot(request(Method::GET, "/pipe/status/track.wav"))
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::OK);

    let missing = app
        .oneshot(request(Method::GET, "/pipe/status/clip.mp4"))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}
