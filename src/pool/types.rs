//! Data model for the container pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One physical/logical compute unit tracked by the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Opaque unique identifier, assigned at creation.
    pub id: Uuid,
    /// Current claimant (project id). `None` means idle and allocatable.
    pub owner_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Network address of the running backend instance, when known.
    pub address: Option<String>,
}

impl Container {
    pub fn is_idle(&self) -> bool {
        self.owner_key.is_none()
    }
}

/// Singleton pool configuration record.
///
/// `current_size` is the cached count of live containers; every insert or
/// delete that changes membership updates it in the same logical step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub min_size: u32,
    pub max_size: u32,
    /// Target number of idle containers the maintenance pass converges toward.
    pub buffer_size: u32,
    pub current_size: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            buffer_size: 2,
            current_size: 0,
        }
    }
}

/// Partial update to [`PoolSettings`]. Absent fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub min_size: Option<u32>,
    pub max_size: Option<u32>,
    pub buffer_size: Option<u32>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.min_size.is_none() && self.max_size.is_none() && self.buffer_size.is_none()
    }
}

/// Kind of an append-only pool event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ContainerCreated,
    ContainerAllocated,
    ContainerDeallocated,
    ContainerShutdown,
    PoolSizeChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContainerCreated => "container_created",
            Self::ContainerAllocated => "container_allocated",
            Self::ContainerDeallocated => "container_deallocated",
            Self::ContainerShutdown => "container_shutdown",
            Self::PoolSizeChanged => "pool_size_changed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "container_created" => Some(Self::ContainerCreated),
            "container_allocated" => Some(Self::ContainerAllocated),
            "container_deallocated" => Some(Self::ContainerDeallocated),
            "container_shutdown" => Some(Self::ContainerShutdown),
            "pool_size_changed" => Some(Self::PoolSizeChanged),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only event log record. Ordering is the append order (`seq`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub seq: u64,
    pub kind: EventKind,
    pub container_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Full, consistent snapshot of both pool tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub containers: Vec<Container>,
    pub settings: PoolSettings,
}

impl StatusSnapshot {
    pub fn idle_count(&self) -> usize {
        self.containers.iter().filter(|c| c.is_idle()).count()
    }
}

/// Message pushed to subscribed observers after every committed mutation.
#[derive(Debug, Clone, Serialize)]
pub struct PoolNotification {
    pub event: PoolEvent,
    pub status: StatusSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_str() {
        for kind in [
            EventKind::ContainerCreated,
            EventKind::ContainerAllocated,
            EventKind::ContainerDeallocated,
            EventKind::ContainerShutdown,
            EventKind::PoolSizeChanged,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("bogus"), None);
    }

    #[test]
    fn default_settings_match_documented_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.min_size, 2);
        assert_eq!(settings.max_size, 10);
        assert_eq!(settings.buffer_size, 2);
        assert_eq!(settings.current_size, 0);
    }

    #[test]
    fn settings_patch_serializes_with_absent_fields() {
        let patch: SettingsPatch = serde_json::from_str(r#"{"buffer_size": 4}"#).unwrap();
        assert_eq!(patch.buffer_size, Some(4));
        assert!(patch.min_size.is_none());
        assert!(!patch.is_empty());
    }
}
