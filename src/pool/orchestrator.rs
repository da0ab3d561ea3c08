//! The pool orchestrator: a single-writer actor owning all pool state.
//!
//! All mutating operations are processed one at a time in arrival order on
//! one command lane, which structurally eliminates the double-allocation
//! race (two callers observing the same idle container before either
//! commits). Backend `start` calls are the only long-blocking operations;
//! they run in spawned tasks and commit back into the lane as
//! `FinishCreate` commands, so one slow start never stalls an unrelated
//! mutation.
//!
//! The authoritative state lives in memory and is mirrored to the durable
//! store row by row; on startup the tables are hydrated back and the pool
//! is refilled to `buffer_size` before the handle serves traffic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::backend::ContainerBackend;
use crate::error::{BackendError, PoolError};
use crate::pool::{
    Container, EventKind, PoolEvent, PoolNotification, PoolSettings, SettingsPatch,
    StatusSnapshot,
};
use crate::store::PoolStore;

const COMMAND_LANE_CAPACITY: usize = 64;
const NOTIFY_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, PoolError>>;

enum Command {
    Allocate {
        owner_key: String,
        reply: Reply<Container>,
    },
    Deallocate {
        id: Uuid,
        reply: Reply<()>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    LookupOwner {
        owner_key: String,
        reply: oneshot::Sender<Option<Uuid>>,
    },
    Events {
        reply: oneshot::Sender<Vec<PoolEvent>>,
    },
    Reset {
        reply: Reply<()>,
    },
    Configure {
        patch: SettingsPatch,
        reply: Reply<StatusSnapshot>,
    },
    Subscribe {
        reply: oneshot::Sender<(StatusSnapshot, broadcast::Receiver<PoolNotification>)>,
    },
    /// Off-lane backend start resolved; commit or discard the outcome.
    FinishCreate {
        ticket: u64,
        epoch: u64,
        id: Uuid,
        outcome: Result<String, BackendError>,
    },
}

/// Why a container is being created.
enum CreatePurpose {
    /// Allocation found no idle container; every waiter gets the result.
    ForOwner {
        owner_key: String,
        waiters: Vec<Reply<Container>>,
    },
    /// Buffer maintenance refill.
    Refill,
}

struct PendingCreate {
    id: Uuid,
    purpose: CreatePurpose,
}

/// Cloneable handle submitting commands to the orchestrator lane.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<Command>,
}

impl PoolHandle {
    async fn submit<T>(&self, cmd: Command, rx: oneshot::Receiver<Result<T, PoolError>>) -> Result<T, PoolError> {
        self.tx.send(cmd).await.map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)?
    }

    /// Allocate a container for `owner_key`, creating one if none is idle.
    ///
    /// Idempotent: a retried call for an owner that already holds a
    /// container returns that container unchanged.
    pub async fn allocate(&self, owner_key: impl Into<String>) -> Result<Container, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            Command::Allocate {
                owner_key: owner_key.into(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Release the container back into the idle set.
    pub async fn deallocate(&self, id: Uuid) -> Result<(), PoolError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Deallocate { id, reply }, rx).await
    }

    /// Consistent snapshot of containers and settings.
    pub async fn status(&self) -> Result<StatusSnapshot, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }

    /// Which container currently serves `owner_key`, if any.
    pub async fn lookup_owner(&self, owner_key: impl Into<String>) -> Result<Option<Uuid>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::LookupOwner {
                owner_key: owner_key.into(),
                reply,
            })
            .await
            .map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }

    /// The ordered event log.
    pub async fn events(&self) -> Result<Vec<PoolEvent>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Events { reply })
            .await
            .map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }

    /// Kill everything, wipe state, and re-initialize like a cold start.
    pub async fn reset(&self) -> Result<(), PoolError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Reset { reply }, rx).await
    }

    /// Apply a partial settings update and converge toward the new target.
    pub async fn configure(&self, patch: SettingsPatch) -> Result<StatusSnapshot, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Configure { patch, reply }, rx).await
    }

    /// Subscribe to the notification stream; the returned snapshot is the
    /// state as of subscription.
    pub async fn subscribe(
        &self,
    ) -> Result<(StatusSnapshot, broadcast::Receiver<PoolNotification>), PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe { reply })
            .await
            .map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }
}

/// Single-writer pool state machine. Constructed via [`Orchestrator::spawn`].
pub struct Orchestrator {
    store: Arc<dyn PoolStore>,
    backend: Arc<dyn ContainerBackend>,
    containers: HashMap<Uuid, Container>,
    settings: PoolSettings,
    events: Vec<PoolEvent>,
    next_seq: u64,
    /// Bumped on reset so in-flight creations from before the reset are
    /// discarded (and their fresh containers killed) when they resolve.
    epoch: u64,
    pending: HashMap<u64, PendingCreate>,
    next_ticket: u64,
    /// Weak self-sender for off-lane completion commands. Weak so the lane
    /// closes once every external handle is dropped.
    lane: mpsc::WeakSender<Command>,
    notify_tx: broadcast::Sender<PoolNotification>,
    needs_maintenance: bool,
}

impl Orchestrator {
    /// Hydrate state from the store, refill the pool to `buffer_size`, and
    /// spawn the command loop. The handle only serves traffic after the
    /// initial fill completed.
    pub async fn spawn(
        store: Arc<dyn PoolStore>,
        backend: Arc<dyn ContainerBackend>,
        initial: PoolSettings,
    ) -> Result<PoolHandle, PoolError> {
        let (tx, rx) = mpsc::channel(COMMAND_LANE_CAPACITY);
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);

        let settings = match store.load_settings().await? {
            Some(persisted) => persisted,
            None => {
                let fresh = PoolSettings {
                    current_size: 0,
                    ..initial
                };
                store.save_settings(&fresh).await?;
                fresh
            }
        };

        let mut containers = HashMap::new();
        for container in store.load_containers().await? {
            containers.insert(container.id, container);
        }

        let mut settings = settings;
        let live = containers.len() as u32;
        if settings.current_size != live {
            tracing::warn!(
                cached = settings.current_size,
                actual = live,
                "Reconciling current_size with container rows"
            );
            settings.current_size = live;
            store.save_settings(&settings).await?;
        }

        let events = store.load_events().await?;
        let next_seq = events.last().map(|e| e.seq + 1).unwrap_or(0);

        let mut orch = Self {
            store,
            backend,
            containers,
            settings,
            events,
            next_seq,
            epoch: 0,
            pending: HashMap::new(),
            next_ticket: 0,
            lane: tx.downgrade(),
            notify_tx,
            needs_maintenance: false,
        };

        orch.startup_fill().await;
        // A restart may also leave too many idle containers; the first loop
        // iteration culls them.
        orch.needs_maintenance = true;

        tokio::spawn(orch.run(rx));
        Ok(PoolHandle { tx })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            // Queued maintenance runs on this same lane, strictly before the
            // next command is accepted.
            while self.needs_maintenance {
                self.needs_maintenance = false;
                self.run_maintenance().await;
            }
            let Some(cmd) = rx.recv().await else { break };
            self.handle(cmd).await;
        }
        tracing::debug!("Pool orchestrator lane closed");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Allocate { owner_key, reply } => self.handle_allocate(owner_key, reply).await,
            Command::Deallocate { id, reply } => self.handle_deallocate(id, reply).await,
            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::LookupOwner { owner_key, reply } => {
                let id = self
                    .containers
                    .values()
                    .find(|c| c.owner_key.as_deref() == Some(owner_key.as_str()))
                    .map(|c| c.id);
                let _ = reply.send(id);
            }
            Command::Events { reply } => {
                let _ = reply.send(self.events.clone());
            }
            Command::Reset { reply } => self.handle_reset(reply).await,
            Command::Configure { patch, reply } => self.handle_configure(patch, reply).await,
            Command::Subscribe { reply } => {
                let _ = reply.send((self.snapshot(), self.notify_tx.subscribe()));
            }
            Command::FinishCreate {
                ticket,
                epoch,
                id,
                outcome,
            } => self.handle_finish_create(ticket, epoch, id, outcome).await,
        }
    }

    // -- Allocation protocol --

    async fn handle_allocate(&mut self, owner_key: String, reply: Reply<Container>) {
        // Idempotent re-allocation: a retried request never double-allocates.
        if let Some(existing) = self
            .containers
            .values()
            .find(|c| c.owner_key.as_deref() == Some(owner_key.as_str()))
        {
            let _ = reply.send(Ok(existing.clone()));
            return;
        }

        // A creation for this owner is already in flight; attach to it.
        for pending in self.pending.values_mut() {
            if let CreatePurpose::ForOwner {
                owner_key: pending_owner,
                waiters,
            } = &mut pending.purpose
            {
                if *pending_owner == owner_key {
                    waiters.push(reply);
                    return;
                }
            }
        }

        // Oldest idle container first: deterministic, not required for
        // correctness.
        let idle = self
            .containers
            .values()
            .filter(|c| c.is_idle())
            .min_by_key(|c| (c.created_at, c.id))
            .map(|c| c.id);

        if let Some(id) = idle {
            match self.bind(id, &owner_key).await {
                Ok(container) => {
                    let _ = reply.send(Ok(container));
                    self.needs_maintenance = true;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
            return;
        }

        // Creation refuses with PoolFull at the cap; the allocation
        // surfaces that as an exhaustion failure.
        if let Err(full) = self.ensure_capacity() {
            let _ = reply.send(Err(PoolError::PoolExhausted {
                owner_key,
                reason: full.to_string(),
            }));
            return;
        }

        self.begin_create(CreatePurpose::ForOwner {
            owner_key,
            waiters: vec![reply],
        });
    }

    /// Bind an idle container to `owner_key`: store first, then memory.
    async fn bind(&mut self, id: Uuid, owner_key: &str) -> Result<Container, PoolError> {
        let mut updated = self
            .containers
            .get(&id)
            .cloned()
            .ok_or(PoolError::NotFound { id })?;
        updated.owner_key = Some(owner_key.to_string());
        updated.last_activity_at = Utc::now();

        self.store.update_container(&updated).await?;
        self.containers.insert(id, updated.clone());
        self.record_event(
            EventKind::ContainerAllocated,
            Some(id),
            json!({ "owner_key": owner_key }),
        )
        .await;
        Ok(updated)
    }

    async fn handle_deallocate(&mut self, id: Uuid, reply: Reply<()>) {
        let Some(container) = self.containers.get(&id) else {
            let _ = reply.send(Err(PoolError::NotFound { id }));
            return;
        };

        let previous_owner = container.owner_key.clone();
        let mut updated = container.clone();
        updated.owner_key = None;
        updated.last_activity_at = Utc::now();

        if let Err(e) = self.store.update_container(&updated).await {
            let _ = reply.send(Err(e.into()));
            return;
        }
        self.containers.insert(id, updated);
        self.record_event(
            EventKind::ContainerDeallocated,
            Some(id),
            json!({ "owner_key": previous_owner }),
        )
        .await;

        let _ = reply.send(Ok(()));
        self.needs_maintenance = true;
    }

    // -- Container creation --

    /// Reserve capacity and start a container off-lane. The outcome commits
    /// back into the lane as `FinishCreate`; until then no row exists and
    /// the reservation only lives in `pending`.
    fn begin_create(&mut self, purpose: CreatePurpose) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let id = Uuid::new_v4();
        self.pending.insert(ticket, PendingCreate { id, purpose });

        let backend = Arc::clone(&self.backend);
        let lane = self.lane.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let outcome = backend.start(id).await;
            if let Some(lane) = lane.upgrade() {
                let _ = lane
                    .send(Command::FinishCreate {
                        ticket,
                        epoch,
                        id,
                        outcome,
                    })
                    .await;
            } else if outcome.is_ok() {
                // Orchestrator is gone; don't leak the fresh container.
                let _ = backend.kill(id).await;
            }
        });
    }

    async fn handle_finish_create(
        &mut self,
        ticket: u64,
        epoch: u64,
        id: Uuid,
        outcome: Result<String, BackendError>,
    ) {
        if epoch != self.epoch {
            // Started before a reset; the pool no longer wants it.
            if outcome.is_ok() {
                self.spawn_kill(id);
            }
            return;
        }
        let Some(pending) = self.pending.remove(&ticket) else {
            return;
        };

        let address = match outcome {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(container_id = %id, error = %e, "Container start failed");
                if let CreatePurpose::ForOwner { owner_key, waiters } = pending.purpose {
                    let reason = e.to_string();
                    for waiter in waiters {
                        let _ = waiter.send(Err(PoolError::PoolExhausted {
                            owner_key: owner_key.clone(),
                            reason: reason.clone(),
                        }));
                    }
                }
                return;
            }
        };

        let now = Utc::now();
        let container = Container {
            id,
            owner_key: None,
            created_at: now,
            last_activity_at: now,
            address: Some(address),
        };

        if let Err(e) = self.commit_created(&container).await {
            tracing::error!(container_id = %id, error = %e, "Failed to commit created container");
            self.spawn_kill(id);
            if let CreatePurpose::ForOwner { owner_key, waiters } = pending.purpose {
                let reason = e.to_string();
                for waiter in waiters {
                    let _ = waiter.send(Err(PoolError::PoolExhausted {
                        owner_key: owner_key.clone(),
                        reason: reason.clone(),
                    }));
                }
            }
            return;
        }

        match pending.purpose {
            CreatePurpose::Refill => {
                // Continue converging; one creation per pass.
                self.needs_maintenance = true;
            }
            CreatePurpose::ForOwner { owner_key, waiters } => {
                match self.bind(id, &owner_key).await {
                    Ok(container) => {
                        for waiter in waiters {
                            let _ = waiter.send(Ok(container.clone()));
                        }
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        for waiter in waiters {
                            let _ = waiter.send(Err(PoolError::PoolExhausted {
                                owner_key: owner_key.clone(),
                                reason: reason.clone(),
                            }));
                        }
                    }
                }
                self.needs_maintenance = true;
            }
        }
    }

    /// Insert the row and bump `current_size` in the same logical step.
    async fn commit_created(&mut self, container: &Container) -> Result<(), PoolError> {
        self.store.insert_container(container).await?;
        self.settings.current_size += 1;
        if let Err(e) = self.store.save_settings(&self.settings).await {
            // Roll the row back so the table and counter stay in sync.
            self.settings.current_size -= 1;
            let _ = self.store.delete_container(container.id).await;
            return Err(e.into());
        }
        self.containers.insert(container.id, container.clone());
        self.record_event(
            EventKind::ContainerCreated,
            Some(container.id),
            json!({ "address": container.address }),
        )
        .await;
        Ok(())
    }

    // -- Buffer maintenance --

    /// Converge the idle count toward `buffer_size`. Idempotent: a second
    /// immediate pass with no intervening mutation is a no-op.
    async fn run_maintenance(&mut self) {
        let mut idle: Vec<(chrono::DateTime<Utc>, Uuid)> = self
            .containers
            .values()
            .filter(|c| c.is_idle())
            .map(|c| (c.created_at, c.id))
            .collect();
        idle.sort();

        let pending_refills = self
            .pending
            .values()
            .filter(|p| matches!(p.purpose, CreatePurpose::Refill))
            .count() as u32;
        let idle_now = idle.len() as u32;
        let buffer = self.settings.buffer_size;

        if idle_now + pending_refills < buffer {
            if let Err(full) = self.ensure_capacity() {
                tracing::debug!(idle = idle_now, buffer, error = %full, "Buffer deficit; skipping refill");
                return;
            }
            self.begin_create(CreatePurpose::Refill);
        } else if idle_now > buffer {
            let excess = (idle_now - buffer) as usize;
            let victims: Vec<Uuid> = idle.into_iter().take(excess).map(|(_, id)| id).collect();

            let mut removed = 0u32;
            for id in victims {
                if let Err(e) = self.store.delete_container(id).await {
                    tracing::error!(container_id = %id, error = %e, "Failed to delete excess container row");
                    continue;
                }
                self.containers.remove(&id);
                removed += 1;
                self.record_event(
                    EventKind::ContainerShutdown,
                    Some(id),
                    json!({ "reason": "excess_idle_container" }),
                )
                .await;
                self.spawn_kill(id);
            }

            if removed > 0 {
                // Single counter update for the whole batch.
                self.settings.current_size = self.settings.current_size.saturating_sub(removed);
                if let Err(e) = self.store.save_settings(&self.settings).await {
                    tracing::error!(error = %e, "Failed to persist current_size after cull");
                }
            }
        }
    }

    /// Blocking initial fill on a cold start, before the lane serves
    /// traffic. A start failure leaves the pool under-filled; the next
    /// maintenance trigger retries.
    async fn startup_fill(&mut self) {
        while self.idle_count() < self.settings.buffer_size
            && self.settings.current_size < self.settings.max_size
        {
            let id = Uuid::new_v4();
            match self.backend.start(id).await {
                Ok(address) => {
                    let now = Utc::now();
                    let container = Container {
                        id,
                        owner_key: None,
                        created_at: now,
                        last_activity_at: now,
                        address: Some(address),
                    };
                    if let Err(e) = self.commit_created(&container).await {
                        tracing::error!(error = %e, "Failed to commit container during startup fill");
                        self.spawn_kill(id);
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Container start failed during startup fill");
                    break;
                }
            }
        }
    }

    // -- Reset and configuration --

    async fn handle_reset(&mut self, reply: Reply<()>) {
        // Best-effort on the backend, authoritative on internal state.
        for id in self.containers.keys().copied().collect::<Vec<_>>() {
            self.spawn_kill(id);
        }
        self.epoch += 1;
        for (_, pending) in self.pending.drain() {
            if let CreatePurpose::ForOwner { owner_key, waiters } = pending.purpose {
                for waiter in waiters {
                    let _ = waiter.send(Err(PoolError::PoolExhausted {
                        owner_key: owner_key.clone(),
                        reason: "pool reset".to_string(),
                    }));
                }
            }
        }

        if let Err(e) = self.store.clear_containers().await {
            let _ = reply.send(Err(e.into()));
            return;
        }
        self.containers.clear();
        self.settings.current_size = 0;
        if let Err(e) = self.store.save_settings(&self.settings).await {
            let _ = reply.send(Err(e.into()));
            return;
        }
        if let Err(e) = self.store.clear_events().await {
            let _ = reply.send(Err(e.into()));
            return;
        }
        // seq keeps counting across resets so ordering stays monotonic.
        self.events.clear();
        self.record_event(EventKind::PoolSizeChanged, None, json!({ "reason": "reset" }))
            .await;

        let _ = reply.send(Ok(()));
        self.needs_maintenance = true;
    }

    async fn handle_configure(&mut self, patch: SettingsPatch, reply: Reply<StatusSnapshot>) {
        let mut candidate = self.settings;
        if let Some(min_size) = patch.min_size {
            candidate.min_size = min_size;
        }
        if let Some(max_size) = patch.max_size {
            candidate.max_size = max_size;
        }
        if let Some(buffer_size) = patch.buffer_size {
            candidate.buffer_size = buffer_size;
        }

        if candidate.min_size > candidate.max_size {
            let _ = reply.send(Err(PoolError::InvalidConfig {
                reason: format!(
                    "min_size ({}) must not exceed max_size ({})",
                    candidate.min_size, candidate.max_size
                ),
            }));
            return;
        }

        if let Err(e) = self.store.save_settings(&candidate).await {
            let _ = reply.send(Err(e.into()));
            return;
        }
        let previous = self.settings;
        self.settings = candidate;
        self.record_event(
            EventKind::PoolSizeChanged,
            None,
            json!({
                "min_size": candidate.min_size,
                "max_size": candidate.max_size,
                "buffer_size": candidate.buffer_size,
                "previous": {
                    "min_size": previous.min_size,
                    "max_size": previous.max_size,
                    "buffer_size": previous.buffer_size,
                },
            }),
        )
        .await;

        let _ = reply.send(Ok(self.snapshot()));
        self.needs_maintenance = true;
    }

    // -- Shared helpers --

    /// Append an event (durable log is best-effort; the in-memory log is
    /// authoritative for ordering) and publish `{event, status}` to
    /// observers. Publish failures never affect the mutation.
    async fn record_event(
        &mut self,
        kind: EventKind,
        container_id: Option<Uuid>,
        details: serde_json::Value,
    ) {
        let event = PoolEvent {
            seq: self.next_seq,
            kind,
            container_id,
            timestamp: Utc::now(),
            details,
        };
        self.next_seq += 1;

        if let Err(e) = self.store.append_event(&event).await {
            tracing::warn!(kind = %event.kind, error = %e, "Failed to persist pool event");
        }
        self.events.push(event.clone());

        let _ = self.notify_tx.send(PoolNotification {
            event,
            status: self.snapshot(),
        });
    }

    fn spawn_kill(&self, id: Uuid) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(e) = backend.kill(id).await {
                tracing::warn!(container_id = %id, error = %e, "Failed to kill container");
            }
        });
    }

    fn snapshot(&self) -> StatusSnapshot {
        let mut containers: Vec<Container> = self.containers.values().cloned().collect();
        containers.sort_by_key(|c| (c.created_at, c.id));
        StatusSnapshot {
            containers,
            settings: self.settings,
        }
    }

    fn idle_count(&self) -> u32 {
        self.containers.values().filter(|c| c.is_idle()).count() as u32
    }

    fn live_plus_pending(&self) -> u32 {
        self.settings.current_size + self.pending.len() as u32
    }

    /// Refuse new creations at the cap. Pending reservations count, so two
    /// bursts can never over-commit `max_size`.
    fn ensure_capacity(&self) -> Result<(), PoolError> {
        if self.live_plus_pending() >= self.settings.max_size {
            return Err(PoolError::PoolFull {
                current: self.settings.current_size,
                max: self.settings.max_size,
            });
        }
        Ok(())
    }
}
