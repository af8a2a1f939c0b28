// ============================================================================
// Stream Manager Tests
// ============================================================================

use std::sync::Arc;

use fanout_bus::{
    TranscodeError,
    engine::ManualEngine,
    pipeline::{PipelineOptions, PipelineState},
};
use futures::StreamExt;

use super::StreamManager;
use crate::config::Registry;

const REGISTRY: &str = r#"{
    "resources": {
        "track.wav": { "source": "/music/track.flac", "profile": "wav" },
        "clip.mp4": { "source": "http://media/clip.mp4", "profile": "mp4", "shared": false },
        "cam.ts": { "source": "rtsp://cam/1", "profile": "mpegts" }
    }
}"#;

fn manager() -> (Arc<StreamManager>, Arc<ManualEngine>) {
    let engine = ManualEngine::new();
    let manager = StreamManager::new(
        engine.clone(),
        Registry::from_json(REGISTRY).unwrap(),
        PipelineOptions::default(),
    );
    (Arc::new(manager), engine)
}

#[tokio::test]
async fn test_unknown_resource() -> anyhow::Result<()> {
    let (manager, engine) = manager();
    assert!(manager.resolve_or_create("nope").await?.is_none());
    assert!(manager.profile("nope")?.is_none());
    assert_eq!(engine.launch_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_shared_resource_is_joined() -> anyhow::Result<()> {
    let (manager, engine) = manager();
    let first = manager.resolve_or_create("/track.wav").await?.unwrap();
    let second = manager.resolve_or_create("track.wav").await?.unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(engine.launch_count(), 1);

    let list = manager.list().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].resource, "track.wav");
    Ok(())
}

#[tokio::test]
async fn test_exclusive_resource_gets_own_pipeline() -> anyhow::Result<()> {
    let (manager, engine) = manager();
    let first = manager.resolve_or_create("clip.mp4").await?.unwrap();
    let second = manager.resolve_or_create("clip.mp4").await?.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(engine.launch_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_source_builds_nothing() {
    let (manager, engine) = manager();
    let Err(err) = manager.resolve_or_create("cam.ts").await else {
        panic!("unsupported source resolved to a pipeline");
    };
    assert!(matches!(
        err.downcast_ref::<TranscodeError>(),
        Some(TranscodeError::UnsupportedSource(_))
    ));
    assert_eq!(engine.launch_count(), 0);
    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn test_terminated_pipeline_is_recreated() -> anyhow::Result<()> {
    let (manager, engine) = manager();
    let first = manager.resolve_or_create("track.wav").await?.unwrap();
    let mut stream = first.attach().await?;
    let feed = engine.take_feed().unwrap();
    feed.eos().await;
    assert!(stream.next().await.is_none());
    first.terminated().await;

    let second = manager.resolve_or_create("track.wav").await?.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(engine.launch_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_status_and_shutdown() -> anyhow::Result<()> {
    let (manager, engine) = manager();
    let handle = manager.resolve_or_create("track.wav").await?.unwrap();
    let _stream = handle.attach().await?;

    let status = manager.status("track.wav").await.unwrap();
    assert_eq!(status.resource, "track.wav");
    assert_ne!(status.state, PipelineState::Terminated);
    assert!(manager.status("clip.mp4").await.is_none());

    manager.shutdown().await;
    assert!(handle.is_terminated());
    assert_eq!(engine.stop_count(), 1);
    Ok(())
}
