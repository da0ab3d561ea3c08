//! End-to-end pool lifecycle tests against the real SQLite store.

use std::sync::Arc;
use std::time::Duration;

use sandpool::pool::{Orchestrator, PoolHandle, PoolSettings, StatusSnapshot};
use sandpool::store::{PoolStore, SqliteStore};
use sandpool::testing::StubBackend;

fn settings(buffer_size: u32, max_size: u32) -> PoolSettings {
    PoolSettings {
        min_size: 0,
        max_size,
        buffer_size,
        current_size: 0,
    }
}

async fn wait_for_idle(handle: &PoolHandle, expected: usize) -> StatusSnapshot {
    for _ in 0..200 {
        let status = handle.status().await.unwrap();
        if status.idle_count() == expected {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pool did not converge to {expected} idle containers");
}

#[tokio::test]
async fn full_lifecycle_with_buffer_two_max_three() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::connect(&dir.path().join("pool.db")).await.unwrap());
    let backend = Arc::new(StubBackend::new());
    let handle = Orchestrator::spawn(store, backend, settings(2, 3)).await.unwrap();

    // Cold start warms the buffer.
    assert_eq!(handle.status().await.unwrap().idle_count(), 2);

    // First allocation binds an idle container and a replacement appears.
    let c1 = handle.allocate("project-a").await.unwrap();
    assert_eq!(c1.owner_key.as_deref(), Some("project-a"));
    let status = wait_for_idle(&handle, 2).await;
    assert_eq!(status.settings.current_size, 3);

    // Two more allocations drain the idle set; max_size blocks refills.
    handle.allocate("project-b").await.unwrap();
    let c3 = handle.allocate("project-c").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.idle_count(), 0);
    assert_eq!(status.settings.current_size, 3);

    // A fourth owner cannot be served.
    let err = handle.allocate("project-d").await.unwrap_err();
    assert_eq!(err.kind(), "pool_exhausted");

    // Releasing one container restores a single idle unit.
    handle.deallocate(c3.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.idle_count(), 1);
    assert_eq!(status.settings.current_size, 3);

    // project-d now succeeds with the freed container.
    let c4 = handle.allocate("project-d").await.unwrap();
    assert_eq!(c4.id, c3.id);
}

#[tokio::test]
async fn allocations_and_settings_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.db");
    let backend = Arc::new(StubBackend::new());

    let (owned_id, idle_total) = {
        let store = Arc::new(SqliteStore::connect(&path).await.unwrap());
        let handle = Orchestrator::spawn(store, backend.clone(), settings(1, 10))
            .await
            .unwrap();
        let container = handle.allocate("project-a").await.unwrap();
        wait_for_idle(&handle, 1).await;
        handle
            .configure(sandpool::pool::SettingsPatch {
                min_size: None,
                max_size: Some(6),
                buffer_size: None,
            })
            .await
            .unwrap();
        (container.id, handle.status().await.unwrap().containers.len())
        // dropping the handle closes the command lane
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let store = Arc::new(SqliteStore::connect(&path).await.unwrap());
    let handle = Orchestrator::spawn(store, backend, settings(1, 10))
        .await
        .unwrap();

    // The binding, the container set, and the configured settings all come
    // back from the store; env defaults do not clobber them.
    assert_eq!(handle.lookup_owner("project-a").await.unwrap(), Some(owned_id));
    let status = handle.status().await.unwrap();
    assert_eq!(status.containers.len(), idle_total);
    assert_eq!(status.settings.max_size, 6);

    let events = handle.events().await.unwrap();
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    let reallocated = handle.allocate("project-a").await.unwrap();
    assert_eq!(reallocated.id, owned_id, "idempotency survives restart");
}

#[tokio::test]
async fn reset_clears_durable_state_too() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.db");
    let backend = Arc::new(StubBackend::new());

    {
        let store = Arc::new(SqliteStore::connect(&path).await.unwrap());
        let handle = Orchestrator::spawn(store, backend.clone(), settings(0, 10))
            .await
            .unwrap();
        handle.allocate("project-a").await.unwrap();
        handle.reset().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let store = Arc::new(SqliteStore::connect(&path).await.unwrap());
    assert!(store.load_containers().await.unwrap().is_empty());

    let handle = Orchestrator::spawn(store, backend, settings(0, 10))
        .await
        .unwrap();
    assert_eq!(handle.lookup_owner("project-a").await.unwrap(), None);
    assert_eq!(handle.status().await.unwrap().settings.current_size, 0);
}
