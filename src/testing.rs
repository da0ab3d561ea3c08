//! Test doubles shared by unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::backend::{BackendResult, ContainerBackend, ProxyRequest, ProxyResponse};
use crate::error::BackendError;

/// Recording container backend with injectable start failures.
///
/// Starts succeed instantly and hand out fake addresses; `fail_starts`
/// makes every subsequent start fail, `fail_next_starts(n)` only the next
/// `n`, and `hold_starts` parks every start until `release_starts`.
pub struct StubBackend {
    started: Mutex<Vec<Uuid>>,
    killed: Mutex<Vec<Uuid>>,
    forwarded: Mutex<Vec<(Uuid, String)>>,
    fail_all_starts: AtomicBool,
    failures_remaining: AtomicUsize,
    hold_starts: watch::Sender<bool>,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            forwarded: Mutex::new(Vec::new()),
            fail_all_starts: AtomicBool::new(false),
            failures_remaining: AtomicUsize::new(0),
            hold_starts: watch::Sender::new(false),
        }
    }
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park every subsequent start until [`Self::release_starts`] is called.
    /// Simulates a slow backend so in-flight creations can be observed.
    pub fn hold_starts(&self) {
        self.hold_starts.send_replace(true);
    }

    pub fn release_starts(&self) {
        self.hold_starts.send_replace(false);
    }

    /// Make every start fail until [`Self::succeed_starts`] is called.
    pub fn fail_starts(&self) {
        self.fail_all_starts.store(true, Ordering::SeqCst);
    }

    pub fn succeed_starts(&self) {
        self.fail_all_starts.store(false, Ordering::SeqCst);
    }

    /// Fail only the next `n` starts.
    pub fn fail_next_starts(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<Uuid> {
        self.started.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<Uuid> {
        self.killed.lock().unwrap().clone()
    }

    pub fn forwarded(&self) -> Vec<(Uuid, String)> {
        self.forwarded.lock().unwrap().clone()
    }

    fn should_fail(&self) -> bool {
        if self.fail_all_starts.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ContainerBackend for StubBackend {
    async fn start(&self, id: Uuid) -> BackendResult<String> {
        let mut parked = self.hold_starts.subscribe();
        while *parked.borrow_and_update() {
            if parked.changed().await.is_err() {
                break;
            }
        }
        if self.should_fail() {
            return Err(BackendError::StartFailed {
                id,
                reason: "injected start failure".to_string(),
            });
        }
        let mut started = self.started.lock().unwrap();
        started.push(id);
        Ok(format!("127.0.0.1:{}", 49000 + started.len()))
    }

    async fn kill(&self, id: Uuid) -> BackendResult<()> {
        self.killed.lock().unwrap().push(id);
        Ok(())
    }

    async fn forward(&self, id: Uuid, request: ProxyRequest) -> BackendResult<ProxyResponse> {
        self.forwarded
            .lock()
            .unwrap()
            .push((id, request.path.clone()));
        Ok(ProxyResponse {
            status: 200,
            body: format!("echo:{}:{}", id, request.path).into_bytes(),
            content_type: Some("text/plain".to_string()),
        })
    }
}
