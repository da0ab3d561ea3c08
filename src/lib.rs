//! sandpool - a warm pool of ephemeral sandbox containers.
//!
//! Keeps `buffer_size` idle containers ready so allocation is usually a
//! pointer swap instead of a cold container start. A single-writer
//! orchestrator owns all pool state; the HTTP gateway and the data-plane
//! proxy are thin layers over it.

pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod store;

pub mod testing;

pub use error::{BackendError, ConfigError, Error, PoolError, StoreError};
pub use pool::{Container, Orchestrator, PoolHandle, PoolSettings};
