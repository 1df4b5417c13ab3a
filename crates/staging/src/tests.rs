//! Unit tests for the staging crate.

use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinSet;

use crate::{
    FilesystemStagingArea, MemoryStagingArea, ResourceState, StagedResourceId, StagingArea,
};

async fn exercise_lifecycle(area: &dyn StagingArea) {
    let id = StagedResourceId::outgoing("store-001", 42);

    assert!(area.find(&id).await.unwrap().is_none());
    assert!(area.read(&id).await.unwrap().is_none());

    let staged = area.write(&id, b"batch,42\ncommit,42\n").await.unwrap();
    assert_eq!(staged.state, ResourceState::Ready);
    assert_eq!(staged.byte_count, 19);
    assert_eq!(
        area.read(&id).await.unwrap().as_deref(),
        Some(&b"batch,42\ncommit,42\n"[..])
    );

    // rewriting replaces the payload
    area.write(&id, b"x").await.unwrap();
    assert_eq!(area.read(&id).await.unwrap(), Some(b"x".to_vec()));

    assert!(area.set_state(&id, ResourceState::Done).await.unwrap());
    assert_eq!(
        area.find(&id).await.unwrap().map(|r| r.state),
        Some(ResourceState::Done)
    );

    let other = StagedResourceId::incoming("corp-000", 7);
    area.write(&other, b"y").await.unwrap();

    assert_eq!(area.purge_done().await.unwrap(), 1);
    assert!(area.find(&id).await.unwrap().is_none());
    assert!(area.find(&other).await.unwrap().is_some());

    assert!(area.delete(&other).await.unwrap());
    assert!(!area.delete(&other).await.unwrap());
    assert!(!area.set_state(&other, ResourceState::Ready).await.unwrap());
}

// ============================================================================
// Backend Tests
// ============================================================================

#[tokio::test]
async fn test_filesystem_lifecycle() {
    let dir = TempDir::new().unwrap();
    let area = FilesystemStagingArea::new(dir.path());
    exercise_lifecycle(&area).await;
}

#[tokio::test]
async fn test_memory_lifecycle() {
    let area = MemoryStagingArea::new();
    exercise_lifecycle(&area).await;
    assert!(area.is_empty().await);
}

#[tokio::test]
async fn test_filesystem_layout() {
    let dir = TempDir::new().unwrap();
    let area = FilesystemStagingArea::new(dir.path());
    let id = StagedResourceId::incoming("corp-000", 3);
    area.write(&id, b"payload").await.unwrap();

    let expected = dir.path().join("incoming").join("corp-000").join("3.ready");
    assert!(expected.exists());
    assert!(!dir.path().join("incoming/corp-000/3.create").exists());
}

#[tokio::test]
async fn test_partial_write_is_not_readable() {
    let dir = TempDir::new().unwrap();
    let area = FilesystemStagingArea::new(dir.path());
    let id = StagedResourceId::outgoing("store-002", 9);

    let node_dir = dir.path().join("outgoing").join("store-002");
    std::fs::create_dir_all(&node_dir).unwrap();
    std::fs::write(node_dir.join("9.create"), b"half").unwrap();

    assert!(area.read(&id).await.unwrap().is_none());
    assert_eq!(
        area.find(&id).await.unwrap().map(|r| r.state),
        Some(ResourceState::Create)
    );

    // a fresh write clears the leftover
    area.write(&id, b"whole").await.unwrap();
    assert_eq!(area.read(&id).await.unwrap(), Some(b"whole".to_vec()));
    assert!(!node_dir.join("9.create").exists());
}

#[tokio::test(flavor = "current_thread")]
async fn test_concurrent_writes_on_single_thread() {
    let dir = TempDir::new().unwrap();
    let area = Arc::new(FilesystemStagingArea::new(dir.path()));
    let payload = vec![b'x'; 1 << 20];

    let mut tasks = JoinSet::new();
    for batch_id in 1..=8 {
        let area = Arc::clone(&area);
        let payload = payload.clone();
        tasks.spawn(async move {
            let id = StagedResourceId::outgoing("store-001", batch_id);
            area.write(&id, &payload).await.unwrap();
            area.set_state(&id, ResourceState::Done).await.unwrap();
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    let staged = area
        .find(&StagedResourceId::outgoing("store-001", 5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(staged.byte_count, 1 << 20);
    assert_eq!(area.purge_done().await.unwrap(), 8);
}

#[test]
fn test_resource_id_display() {
    assert_eq!(
        StagedResourceId::outgoing("store-001", 5).to_string(),
        "outgoing/store-001/5"
    );
    assert_eq!(ResourceState::parse("done"), Some(ResourceState::Done));
    assert_eq!(ResourceState::parse("nope"), None);
}
