//! Warm container pool orchestration.
//!
//! The orchestrator is a single-writer actor: every mutation of pool state
//! flows through one command lane, so two concurrent allocations can never
//! both observe the same idle container.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Pool Orchestrator                │
//! │                                               │
//! │  PoolHandle ──▶ command lane (mpsc)           │
//! │    allocate / deallocate / status / reset     │
//! │    configure / lookup_owner / events          │
//! │                                               │
//! │  state: containers + settings + event log     │
//! │    mirrored to the durable store              │
//! │                                               │
//! │  maintenance: converge idle count toward      │
//! │    buffer_size after every mutation           │
//! │                                               │
//! │  fan-out: broadcast {event, status} to        │
//! │    subscribed observers                       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Container starts run off-lane in spawned tasks and commit back into the
//! lane once the backend call resolves, so one slow start never stalls an
//! unrelated deallocate.

mod orchestrator;
mod types;

pub use orchestrator::{Orchestrator, PoolHandle};
pub use types::{
    Container, EventKind, PoolEvent, PoolNotification, PoolSettings, SettingsPatch,
    StatusSnapshot,
};
