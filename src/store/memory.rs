//! In-memory store for tests and `--no-db` mode.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{PoolStore, StoreResult};
use crate::pool::{Container, PoolEvent, PoolSettings};

#[derive(Debug, Default)]
pub struct MemoryStore {
    containers: RwLock<HashMap<Uuid, Container>>,
    settings: RwLock<Option<PoolSettings>>,
    events: RwLock<Vec<PoolEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn load_containers(&self) -> StoreResult<Vec<Container>> {
        Ok(self.containers.read().await.values().cloned().collect())
    }

    async fn insert_container(&self, container: &Container) -> StoreResult<()> {
        self.containers
            .write()
            .await
            .insert(container.id, container.clone());
        Ok(())
    }

    async fn update_container(&self, container: &Container) -> StoreResult<()> {
        self.containers
            .write()
            .await
            .insert(container.id, container.clone());
        Ok(())
    }

    async fn delete_container(&self, id: Uuid) -> StoreResult<()> {
        self.containers.write().await.remove(&id);
        Ok(())
    }

    async fn clear_containers(&self) -> StoreResult<()> {
        self.containers.write().await.clear();
        Ok(())
    }

    async fn load_settings(&self) -> StoreResult<Option<PoolSettings>> {
        Ok(*self.settings.read().await)
    }

    async fn save_settings(&self, settings: &PoolSettings) -> StoreResult<()> {
        *self.settings.write().await = Some(*settings);
        Ok(())
    }

    async fn append_event(&self, event: &PoolEvent) -> StoreResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn load_events(&self) -> StoreResult<Vec<PoolEvent>> {
        Ok(self.events.read().await.clone())
    }

    async fn clear_events(&self) -> StoreResult<()> {
        self.events.write().await.clear();
        Ok(())
    }
}
