//! Durable store adapter for the pool's three logical tables:
//! containers, events, and the singleton settings record.
//!
//! The orchestrator is the only writer. Each method is a single atomic
//! statement from the orchestrator's point of view; interleaving between
//! calls is prevented by the single-writer command lane, not by the store.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::pool::{Container, PoolEvent, PoolSettings};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Load every container row, in no particular order.
    async fn load_containers(&self) -> StoreResult<Vec<Container>>;

    async fn insert_container(&self, container: &Container) -> StoreResult<()>;

    /// Overwrite the row for `container.id`.
    async fn update_container(&self, container: &Container) -> StoreResult<()>;

    async fn delete_container(&self, id: Uuid) -> StoreResult<()>;

    async fn clear_containers(&self) -> StoreResult<()>;

    /// Load the settings record, or `None` on first boot.
    async fn load_settings(&self) -> StoreResult<Option<PoolSettings>>;

    /// Upsert the singleton settings record.
    async fn save_settings(&self, settings: &PoolSettings) -> StoreResult<()>;

    async fn append_event(&self, event: &PoolEvent) -> StoreResult<()>;

    /// Load the full event log in append order.
    async fn load_events(&self) -> StoreResult<Vec<PoolEvent>>;

    async fn clear_events(&self) -> StoreResult<()>;
}
