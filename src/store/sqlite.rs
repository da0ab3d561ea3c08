//! SQLite-backed store.
//!
//! The orchestrator keeps its authoritative state in memory and mirrors
//! every mutation here; on startup the tables are hydrated back. Schema is
//! bootstrapped with `CREATE TABLE IF NOT EXISTS`, so no separate migration
//! step is needed.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{PoolStore, StoreResult};
use crate::error::StoreError;
use crate::pool::{Container, EventKind, PoolEvent, PoolSettings};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file and bootstrap the schema.
    pub async fn connect(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        // One connection: the orchestrator is the sole writer anyway, and a
        // single SQLite writer avoids SQLITE_BUSY entirely.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection {
                reason: e.to_string(),
            })?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                owner_key TEXT NULL,
                created_at_ms INTEGER NOT NULL,
                last_activity_at_ms INTEGER NOT NULL,
                address TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pool_events (
                seq INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                container_id TEXT NULL,
                timestamp_ms INTEGER NOT NULL,
                details TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pool_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                min_size INTEGER NOT NULL,
                max_size INTEGER NOT NULL,
                buffer_size INTEGER NOT NULL,
                current_size INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(())
    }
}

#[async_trait]
impl PoolStore for SqliteStore {
    async fn load_containers(&self) -> StoreResult<Vec<Container>> {
        let rows = sqlx::query(
            "SELECT id, owner_key, created_at_ms, last_activity_at_ms, address FROM containers",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        let mut containers = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(query_err)?;
            let id = Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt {
                table: "containers",
                reason: format!("bad container id '{id}': {e}"),
            })?;
            let created_at_ms: i64 = row.try_get("created_at_ms").map_err(query_err)?;
            let last_activity_at_ms: i64 =
                row.try_get("last_activity_at_ms").map_err(query_err)?;

            containers.push(Container {
                id,
                owner_key: row.try_get("owner_key").map_err(query_err)?,
                created_at: millis_to_utc(created_at_ms, "containers")?,
                last_activity_at: millis_to_utc(last_activity_at_ms, "containers")?,
                address: row.try_get("address").map_err(query_err)?,
            });
        }
        Ok(containers)
    }

    async fn insert_container(&self, container: &Container) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO containers (id, owner_key, created_at_ms, last_activity_at_ms, address)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(container.id.to_string())
        .bind(&container.owner_key)
        .bind(container.created_at.timestamp_millis())
        .bind(container.last_activity_at.timestamp_millis())
        .bind(&container.address)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn update_container(&self, container: &Container) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE containers
            SET owner_key = ?2, created_at_ms = ?3, last_activity_at_ms = ?4, address = ?5
            WHERE id = ?1
            "#,
        )
        .bind(container.id.to_string())
        .bind(&container.owner_key)
        .bind(container.created_at.timestamp_millis())
        .bind(container.last_activity_at.timestamp_millis())
        .bind(&container.address)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn delete_container(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM containers WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn clear_containers(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM containers")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn load_settings(&self) -> StoreResult<Option<PoolSettings>> {
        let row = sqlx::query(
            "SELECT min_size, max_size, buffer_size, current_size FROM pool_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(PoolSettings {
            min_size: column_u32(&row, "min_size")?,
            max_size: column_u32(&row, "max_size")?,
            buffer_size: column_u32(&row, "buffer_size")?,
            current_size: column_u32(&row, "current_size")?,
        }))
    }

    async fn save_settings(&self, settings: &PoolSettings) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pool_settings (id, min_size, max_size, buffer_size, current_size)
            VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT (id) DO UPDATE SET
                min_size = excluded.min_size,
                max_size = excluded.max_size,
                buffer_size = excluded.buffer_size,
                current_size = excluded.current_size
            "#,
        )
        .bind(settings.min_size as i64)
        .bind(settings.max_size as i64)
        .bind(settings.buffer_size as i64)
        .bind(settings.current_size as i64)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn append_event(&self, event: &PoolEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pool_events (seq, kind, container_id, timestamp_ms, details)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(event.seq as i64)
        .bind(event.kind.as_str())
        .bind(event.container_id.map(|id| id.to_string()))
        .bind(event.timestamp.timestamp_millis())
        .bind(event.details.to_string())
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn load_events(&self) -> StoreResult<Vec<PoolEvent>> {
        let rows = sqlx::query(
            "SELECT seq, kind, container_id, timestamp_ms, details FROM pool_events ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.try_get("seq").map_err(query_err)?;
            let kind: String = row.try_get("kind").map_err(query_err)?;
            let kind = EventKind::parse(&kind).ok_or_else(|| StoreError::Corrupt {
                table: "pool_events",
                reason: format!("unknown event kind '{kind}'"),
            })?;
            let container_id: Option<String> = row.try_get("container_id").map_err(query_err)?;
            let container_id = match container_id {
                Some(raw) => Some(Uuid::parse_str(&raw).map_err(|e| StoreError::Corrupt {
                    table: "pool_events",
                    reason: format!("bad container id '{raw}': {e}"),
                })?),
                None => None,
            };
            let timestamp_ms: i64 = row.try_get("timestamp_ms").map_err(query_err)?;
            let details: String = row.try_get("details").map_err(query_err)?;

            events.push(PoolEvent {
                seq: seq as u64,
                kind,
                container_id,
                timestamp: millis_to_utc(timestamp_ms, "pool_events")?,
                details: serde_json::from_str(&details).map_err(|e| StoreError::Corrupt {
                    table: "pool_events",
                    reason: format!("bad details payload: {e}"),
                })?,
            });
        }
        Ok(events)
    }

    async fn clear_events(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM pool_events")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Query {
        reason: e.to_string(),
    }
}

fn millis_to_utc(ms: i64, table: &'static str) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(StoreError::Corrupt {
        table,
        reason: format!("timestamp {ms} out of range"),
    })
}

fn column_u32(row: &sqlx::sqlite::SqliteRow, name: &str) -> StoreResult<u32> {
    let value: i64 = row.try_get(name).map_err(query_err)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt {
        table: "pool_settings",
        reason: format!("negative or oversized value {value} in column '{name}'"),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect(&dir.path().join("pool.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn containers_survive_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");

        let now = Utc::now();
        let container = Container {
            id: Uuid::new_v4(),
            owner_key: Some("project-7".to_string()),
            created_at: now,
            last_activity_at: now,
            address: Some("127.0.0.1:4901".to_string()),
        };

        {
            let store = SqliteStore::connect(&path).await.unwrap();
            store.insert_container(&container).await.unwrap();
        }

        let store = SqliteStore::connect(&path).await.unwrap();
        let loaded = store.load_containers().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, container.id);
        assert_eq!(loaded[0].owner_key.as_deref(), Some("project-7"));
        assert_eq!(loaded[0].address.as_deref(), Some("127.0.0.1:4901"));
        // Millisecond precision survives the round trip.
        assert_eq!(
            loaded[0].created_at.timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn settings_upsert_overwrites_single_row() {
        let (_dir, store) = temp_store().await;
        assert!(store.load_settings().await.unwrap().is_none());

        let mut settings = PoolSettings::default();
        store.save_settings(&settings).await.unwrap();

        settings.buffer_size = 5;
        settings.current_size = 3;
        store.save_settings(&settings).await.unwrap();

        assert_eq!(store.load_settings().await.unwrap(), Some(settings));
    }

    #[tokio::test]
    async fn events_load_in_seq_order() {
        let (_dir, store) = temp_store().await;
        let id = Uuid::new_v4();

        for (seq, kind) in [
            (0, EventKind::ContainerCreated),
            (1, EventKind::ContainerAllocated),
            (2, EventKind::ContainerDeallocated),
        ] {
            store
                .append_event(&PoolEvent {
                    seq,
                    kind,
                    container_id: Some(id),
                    timestamp: Utc::now(),
                    details: serde_json::json!({"owner_key": "p1"}),
                })
                .await
                .unwrap();
        }

        let events = store.load_events().await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::ContainerCreated);
        assert_eq!(events[2].kind, EventKind::ContainerDeallocated);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

        store.clear_events().await.unwrap();
        assert!(store.load_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_and_delete_container() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();
        let mut container = Container {
            id: Uuid::new_v4(),
            owner_key: None,
            created_at: now,
            last_activity_at: now,
            address: None,
        };
        store.insert_container(&container).await.unwrap();

        container.owner_key = Some("p1".to_string());
        store.update_container(&container).await.unwrap();
        let loaded = store.load_containers().await.unwrap();
        assert_eq!(loaded[0].owner_key.as_deref(), Some("p1"));

        store.delete_container(container.id).await.unwrap();
        assert!(store.load_containers().await.unwrap().is_empty());
    }
}
