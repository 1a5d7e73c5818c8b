//! # Operation Queue
//!
//! Durable queue of mutations that must eventually reach the server.
//!
//! ## Drain Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           drain()                                       │
//! │                                                                         │
//! │  drain_slot empty? ──no──► join the running pass (same DrainReport)    │
//! │        │yes                                                             │
//! │        ▼                                                                │
//! │  spawn pass ─► load all pending ─► DrainPlan (entity FIFO + priority)  │
//! │                                         │                               │
//! │        ┌────────────────────────────────┘                               │
//! │        ▼                                                                │
//! │  stop requested / offline? ──yes──► end pass                           │
//! │        │no                                                              │
//! │        ▼                                                                │
//! │  not_before in future? ──yes──► defer rest of entity group             │
//! │        │no                                                              │
//! │        ▼                                                                │
//! │  AuthPipeline::send                                                     │
//! │     2xx ─────────────► delete                                          │
//! │     AuthFailure, no session left ─► halt pass (retry_count untouched)  │
//! │     other failure ───► retry_count += 1                                │
//! │     (incl. 401 again after a successful refresh)                       │
//! │                          ├─ exhausted ─► delete + DeadLetter event     │
//! │                          └─ otherwise ─► persist, defer entity group   │
//! │                                                                         │
//! │  StorageFailure anywhere aborts the pass and is returned.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pass runs in its own task: dropping every caller of `drain()` does not
//! interrupt it between the network call and the store update.

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::auth::AuthPipeline;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, Subscription};
use crate::transport::{Connectivity, HttpRequest};
use tether_core::{
    DeadLetter, DrainPlan, PendingOperation, PendingOperationInput, SyncStatus,
};
use tether_db::{Database, DbError, PendingOperationRepository};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Operations sent to the server.
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed but still pending.
    pub failed: usize,
    pub dead_lettered: usize,
    /// Skipped this pass (Retry-After window, or behind a failed operation
    /// of the same entity).
    pub deferred: usize,
    /// Set when the pass stopped on an authentication failure.
    pub halted: Option<SyncError>,
    /// Set when the pass ended early on `request_stop`, close, or going offline.
    pub stopped: bool,
}

#[derive(Debug, Default)]
struct StatusCell {
    is_syncing: bool,
    last_sync_time: Option<DateTime<Utc>>,
    sync_error_count: u64,
    pending_count: u64,
}

type DrainFuture = Shared<BoxFuture<'static, SyncResult<DrainReport>>>;

struct QueueShared {
    repo: PendingOperationRepository,
    pipeline: AuthPipeline,
    connectivity: Connectivity,
    default_max_retries: u32,
    drain_slot: Mutex<Option<DrainFuture>>,
    stop_requested: AtomicBool,
    closed: AtomicBool,
    status: Mutex<StatusCell>,
    status_events: EventBus<SyncStatus>,
    dead_letters: EventBus<DeadLetter>,
}

/// Handle to the operation queue. Cheap to clone.
#[derive(Clone)]
pub struct OperationQueue {
    shared: Arc<QueueShared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl OperationQueue {
    pub fn new(
        db: &Database,
        pipeline: AuthPipeline,
        connectivity: Connectivity,
        default_max_retries: u32,
    ) -> Self {
        OperationQueue {
            shared: Arc::new(QueueShared {
                repo: db.pending_operations(),
                pipeline,
                connectivity,
                default_max_retries,
                drain_slot: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                status: Mutex::new(StatusCell::default()),
                status_events: EventBus::new(),
                dead_letters: EventBus::new(),
            }),
        }
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Validates and persists a mutation. Returns its id.
    ///
    /// Fires a background drain when online. Invalid input is rejected with
    /// `ValidationFailure` and nothing is written.
    pub async fn enqueue(&self, mut input: PendingOperationInput) -> SyncResult<String> {
        self.ensure_open()?;

        if input.max_retries.is_none() {
            input.max_retries = Some(self.shared.default_max_retries);
        }

        let op = PendingOperation::from_input(input, Utc::now())?;
        let op = self.shared.repo.insert(&op).await?;

        info!(
            id = %op.id,
            target = %op.target,
            priority = op.priority.as_str(),
            "Operation enqueued"
        );

        self.publish_status().await;

        if self.shared.connectivity.is_online() {
            self.trigger_drain();
        }

        Ok(op.id)
    }

    // =========================================================================
    // Drain
    // =========================================================================

    /// Replays pending operations.
    ///
    /// Concurrent callers share one pass and receive the same report.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        self.ensure_open()?;
        self.drain_handle().await
    }

    /// Starts a pass unless one is running, without waiting for it.
    pub fn trigger_drain(&self) {
        if self.ensure_open().is_ok() {
            drop(self.drain_handle());
        }
    }

    pub fn is_draining(&self) -> bool {
        lock(&self.shared.drain_slot).is_some()
    }

    fn drain_handle(&self) -> DrainFuture {
        let mut slot = lock(&self.shared.drain_slot);
        if let Some(running) = slot.as_ref() {
            debug!("Drain already in progress; joining");
            return running.clone();
        }

        self.shared.stop_requested.store(false, Ordering::SeqCst);

        // The slot lock is held until the handle is stored, so the task
        // cannot clear the slot before it is filled.
        let queue = self.clone();
        let task = tokio::spawn(async move {
            let result = queue.run_pass().await;
            *lock(&queue.shared.drain_slot) = None;
            result
        });

        let handle = async move {
            task.await.unwrap_or_else(|e| {
                Err(SyncError::Internal(format!("drain task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        *slot = Some(handle.clone());
        handle
    }

    /// Asks the running pass to stop before its next operation.
    pub fn request_stop(&self) {
        if self.is_draining() {
            debug!("Stop requested for running drain");
        }
        self.shared.stop_requested.store(true, Ordering::SeqCst);
    }

    fn should_stop(&self) -> bool {
        self.shared.stop_requested.load(Ordering::SeqCst)
            || self.shared.closed.load(Ordering::SeqCst)
            || !self.shared.connectivity.is_online()
    }

    async fn run_pass(&self) -> SyncResult<DrainReport> {
        if !self.shared.connectivity.is_online() {
            debug!("Offline; skipping drain");
            return Ok(DrainReport {
                stopped: true,
                ..DrainReport::default()
            });
        }

        lock(&self.shared.status).is_syncing = true;
        self.publish_status().await;

        let mut report = DrainReport::default();
        let result = self.replay_pending(&mut report).await;

        {
            let mut status = lock(&self.shared.status);
            status.is_syncing = false;
            status.last_sync_time = Some(Utc::now());
        }
        self.publish_status().await;

        match result {
            Ok(()) => {
                info!(
                    attempted = report.attempted,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    dead_lettered = report.dead_lettered,
                    deferred = report.deferred,
                    "Drain pass finished"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Drain pass aborted");
                Err(e)
            }
        }
    }

    async fn replay_pending(&self, report: &mut DrainReport) -> SyncResult<()> {
        let pending = self.shared.repo.list_all().await?;
        if pending.is_empty() {
            return Ok(());
        }

        debug!(pending = pending.len(), "Starting drain pass");
        let mut plan = DrainPlan::from_pending(pending);

        while let Some(op) = plan.next_operation() {
            if self.should_stop() {
                report.stopped = true;
                report.deferred += plan.len() + 1;
                break;
            }

            let now = Utc::now();
            if op.is_deferred(now) {
                debug!(id = %op.id, not_before = ?op.not_before, "Operation waiting for Retry-After");
                report.deferred += 1 + plan.defer_group(&op.group_key());
                continue;
            }

            report.attempted += 1;
            match self.shared.pipeline.send(HttpRequest::from_operation(&op)).await {
                Ok(response) if response.is_success() => {
                    self.shared.repo.delete(&op.id).await?;
                    report.succeeded += 1;
                    debug!(id = %op.id, status = response.status, "Operation delivered");
                    self.publish_status().await;
                }
                Ok(response) => {
                    let not_before = response.retry_after(Utc::now());
                    let error = match response.error_for_status() {
                        Err(e) => e,
                        Ok(r) => SyncError::ServerError {
                            status: r.status,
                            message: "unexpected status".into(),
                        },
                    };
                    self.handle_failure(op, error, not_before, &mut plan, report)
                        .await?;
                }
                Err(e) if e.is_auth_error() => {
                    if self.shared.pipeline.is_authenticated().await {
                        // The session survived a refresh; this endpoint rejects it.
                        self.handle_failure(op, e, None, &mut plan, report).await?;
                    } else {
                        warn!(id = %op.id, error = %e, "Session ended; halting drain");
                        report.deferred += plan.len() + 1;
                        report.halted = Some(e);
                        break;
                    }
                }
                Err(e) if e.is_storage_error() => return Err(e),
                Err(e) => {
                    self.handle_failure(op, e, None, &mut plan, report).await?;
                }
            }
        }

        Ok(())
    }

    async fn handle_failure(
        &self,
        mut op: PendingOperation,
        error: SyncError,
        not_before: Option<DateTime<Utc>>,
        plan: &mut DrainPlan,
        report: &mut DrainReport,
    ) -> SyncResult<()> {
        let exhausted = op.record_failure(error.to_string(), not_before);

        if exhausted {
            // Already gone means it was cleared concurrently; no event then.
            if self.shared.repo.delete(&op.id).await? {
                warn!(
                    id = %op.id,
                    target = %op.target,
                    attempts = op.retry_count,
                    error = %error,
                    "Operation dead-lettered"
                );
                lock(&self.shared.status).sync_error_count += 1;
                report.dead_lettered += 1;

                let last_error = error.to_string();
                self.shared.dead_letters.emit(&DeadLetter {
                    operation: op,
                    last_error,
                    dead_lettered_at: Utc::now(),
                });
                self.publish_status().await;
            }
            return Ok(());
        }

        match self.shared.repo.update(&op).await {
            Ok(()) | Err(DbError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        report.failed += 1;
        let held_back = plan.defer_group(&op.group_key());
        report.deferred += held_back;

        debug!(
            id = %op.id,
            retry_count = op.retry_count,
            max_retries = op.max_retries,
            held_back,
            error = %error,
            "Operation failed; will retry"
        );
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Discards every pending operation. Returns how many were removed.
    pub async fn clear_pending(&self) -> SyncResult<u64> {
        let removed = self.shared.repo.clear().await?;
        info!(removed, "Pending operations discarded");
        self.publish_status().await;
        Ok(removed)
    }

    pub async fn pending(&self) -> SyncResult<Vec<PendingOperation>> {
        Ok(self.shared.repo.list_all().await?)
    }

    /// Resets `sync_error_count`.
    pub async fn acknowledge_errors(&self) {
        lock(&self.shared.status).sync_error_count = 0;
        self.publish_status().await;
    }

    /// Stops accepting work and waits for a running pass to finish.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        let running = lock(&self.shared.drain_slot).clone();
        if let Some(running) = running {
            if let Err(e) = running.await {
                debug!(error = %e, "Drain ended with error during close");
            }
        }
    }

    // =========================================================================
    // Status & Events
    // =========================================================================

    /// Current snapshot, with `pending_count` read from the store.
    pub async fn status(&self) -> SyncResult<SyncStatus> {
        let pending = self.shared.repo.count().await?;
        let mut cell = lock(&self.shared.status);
        cell.pending_count = pending;
        Ok(self.snapshot(&cell))
    }

    /// Last known snapshot, without touching the store.
    pub fn last_status(&self) -> SyncStatus {
        self.snapshot(&lock(&self.shared.status))
    }

    fn snapshot(&self, cell: &StatusCell) -> SyncStatus {
        SyncStatus {
            is_online: self.shared.connectivity.is_online(),
            is_syncing: cell.is_syncing,
            pending_count: cell.pending_count,
            last_sync_time: cell.last_sync_time,
            sync_error_count: cell.sync_error_count,
        }
    }

    /// Recomputes the status and notifies listeners.
    pub async fn publish_status(&self) {
        let status = match self.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Pending count unavailable; publishing last known");
                self.last_status()
            }
        };
        self.shared.status_events.emit(&status);
    }

    pub fn on_status_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.shared.status_events.subscribe(listener)
    }

    pub fn on_dead_letter<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DeadLetter) + Send + Sync + 'static,
    {
        self.shared.dead_letters.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenRefresher;
    use crate::transport::{HttpResponse, HttpTransport};
    use crate::vault::MemoryVault;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tether_core::{AuthSession, HttpMethod, Priority};
    use tether_db::DbConfig;

    /// Answers 200 unless a status is scripted for the path.
    #[derive(Default)]
    struct ScriptedServer {
        statuses: StdMutex<HashMap<String, HttpResponse>>,
        delivered: StdMutex<Vec<String>>,
        delay: Option<Duration>,
        stop_after_first: StdMutex<Option<OperationQueue>>,
    }

    impl ScriptedServer {
        fn respond(&self, path: &str, response: HttpResponse) {
            self.statuses.lock().unwrap().insert(path.to_string(), response);
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedServer {
        async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.delivered
                .lock()
                .unwrap()
                .push(format!("{} {}", request.method.as_str(), request.path));

            if let Some(queue) = self.stop_after_first.lock().unwrap().take() {
                queue.request_stop();
            }

            Ok(self
                .statuses
                .lock()
                .unwrap()
                .get(&request.path)
                .cloned()
                .unwrap_or_else(|| HttpResponse::new(200)))
        }
    }

    struct NoRefresh;

    #[async_trait]
    impl TokenRefresher for NoRefresh {
        async fn refresh(&self, _session: &AuthSession) -> SyncResult<AuthSession> {
            Err(SyncError::AuthFailure("refresh disabled".into()))
        }
    }

    /// Always succeeds with a new access token.
    #[derive(Default)]
    struct RotatingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresher for RotatingRefresher {
        async fn refresh(&self, session: &AuthSession) -> SyncResult<AuthSession> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AuthSession::new(
                format!("token-{}", n),
                session.refresh_token.clone(),
            ))
        }
    }

    async fn setup(server: Arc<ScriptedServer>, signed_in: bool) -> (OperationQueue, Connectivity) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let pipeline = AuthPipeline::new(server, Arc::new(NoRefresh), Arc::new(MemoryVault::new()));
        if signed_in {
            pipeline
                .sign_in(AuthSession::new("token", "refresh"))
                .await
                .unwrap();
        }
        let connectivity = Connectivity::new(false);
        let queue = OperationQueue::new(&db, pipeline, connectivity.clone(), 3);
        (queue, connectivity)
    }

    fn post(path: &str) -> PendingOperationInput {
        PendingOperationInput::new(HttpMethod::Post, path)
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_without_persisting() {
        let (queue, _) = setup(Arc::new(ScriptedServer::default()), true).await;

        let err = queue.enqueue(post("")).await.unwrap_err();
        assert!(matches!(err, SyncError::ValidationFailure(_)));

        let err = queue.enqueue(post("/x").max_retries(0)).await.unwrap_err();
        assert!(matches!(err, SyncError::ValidationFailure(_)));

        assert_eq!(queue.status().await.unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_enqueue_applies_configured_default_retries() {
        let server = Arc::new(ScriptedServer::default());
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let pipeline = AuthPipeline::new(server, Arc::new(NoRefresh), Arc::new(MemoryVault::new()));
        let queue = OperationQueue::new(&db, pipeline, Connectivity::new(false), 7);

        queue.enqueue(post("/a")).await.unwrap();
        queue.enqueue(post("/b").max_retries(2)).await.unwrap();

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending[0].max_retries, 7);
        assert_eq!(pending[1].max_retries, 2);
    }

    #[tokio::test]
    async fn test_drain_keeps_entity_order_across_priorities() {
        let server = Arc::new(ScriptedServer::default());
        let (queue, connectivity) = setup(server.clone(), true).await;

        queue
            .enqueue(post("/deals").entity("deal", "42").priority(Priority::Low))
            .await
            .unwrap();
        queue
            .enqueue(post("/notes").priority(Priority::Medium))
            .await
            .unwrap();
        queue
            .enqueue(
                PendingOperationInput::new(HttpMethod::Patch, "/deals/42")
                    .entity("deal", "42")
                    .priority(Priority::High),
            )
            .await
            .unwrap();

        connectivity.set_online(true);
        let report = queue.drain().await.unwrap();

        // The high-priority patch lifts its whole group, but cannot pass the create.
        assert_eq!(report.succeeded, 3);
        assert_eq!(
            server.delivered(),
            vec!["POST /deals", "PATCH /deals/42", "POST /notes"]
        );
        assert_eq!(queue.status().await.unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_offline_drain_sends_nothing() {
        let server = Arc::new(ScriptedServer::default());
        let (queue, _) = setup(server.clone(), true).await;

        queue.enqueue(post("/a")).await.unwrap();
        let report = queue.drain().await.unwrap();

        assert!(report.stopped);
        assert!(server.delivered().is_empty());
        assert_eq!(queue.status().await.unwrap().pending_count, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_retries() {
        let server = Arc::new(ScriptedServer::default());
        server.respond("/fail", HttpResponse::new(500));
        let (queue, connectivity) = setup(server.clone(), true).await;

        let letters = Arc::new(StdMutex::new(Vec::new()));
        let letters2 = Arc::clone(&letters);
        let _sub = queue.on_dead_letter(move |d| letters2.lock().unwrap().push(d.clone()));

        let id = queue.enqueue(post("/fail").max_retries(3)).await.unwrap();
        connectivity.set_online(true);

        for _ in 0..5 {
            queue.drain().await.unwrap();
        }

        assert_eq!(server.delivered().len(), 3);
        let letters = letters.lock().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].operation.id, id);
        assert_eq!(letters[0].operation.retry_count, 3);
        assert!(letters[0].last_error.contains("500"));

        let status = queue.status().await.unwrap();
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.sync_error_count, 1);

        queue.acknowledge_errors().await;
        assert_eq!(queue.status().await.unwrap().sync_error_count, 0);
    }

    #[tokio::test]
    async fn test_failure_holds_back_same_entity_only() {
        let server = Arc::new(ScriptedServer::default());
        server.respond("/deals", HttpResponse::new(503));
        let (queue, connectivity) = setup(server.clone(), true).await;

        queue.enqueue(post("/deals").entity("deal", "42")).await.unwrap();
        queue
            .enqueue(PendingOperationInput::new(HttpMethod::Patch, "/deals/42").entity("deal", "42"))
            .await
            .unwrap();
        queue.enqueue(post("/notes")).await.unwrap();

        connectivity.set_online(true);
        let report = queue.drain().await.unwrap();

        assert_eq!(server.delivered(), vec!["POST /deals", "POST /notes"]);
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.succeeded, 1);

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].retry_count, 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("503"));
        assert_eq!(pending[1].retry_count, 0);
    }

    #[tokio::test]
    async fn test_retry_after_defers_next_pass() {
        let server = Arc::new(ScriptedServer::default());
        server.respond(
            "/busy",
            HttpResponse::new(429).with_header("Retry-After", "120"),
        );
        let (queue, connectivity) = setup(server.clone(), true).await;

        queue.enqueue(post("/busy")).await.unwrap();
        connectivity.set_online(true);

        queue.drain().await.unwrap();
        let op = &queue.pending().await.unwrap()[0];
        assert!(op.not_before.unwrap() > Utc::now() + chrono::Duration::seconds(100));

        let report = queue.drain().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(server.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_halts_without_counting_retry() {
        let server = Arc::new(ScriptedServer::default());
        let (queue, connectivity) = setup(server.clone(), false).await;

        queue.enqueue(post("/a")).await.unwrap();
        queue.enqueue(post("/b")).await.unwrap();
        connectivity.set_online(true);

        let report = queue.drain().await.unwrap();
        assert!(report.halted.as_ref().unwrap().is_auth_error());
        assert_eq!(report.deferred, 2);

        for op in queue.pending().await.unwrap() {
            assert_eq!(op.retry_count, 0);
        }
    }

    #[tokio::test]
    async fn test_endpoint_rejecting_refreshed_token_spends_retries() {
        let server = Arc::new(ScriptedServer::default());
        server.respond("/forbidden", HttpResponse::new(401));
        let refresher = Arc::new(RotatingRefresher::default());

        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let pipeline = AuthPipeline::new(
            server.clone(),
            refresher.clone(),
            Arc::new(MemoryVault::new()),
        );
        pipeline
            .sign_in(AuthSession::new("token", "refresh"))
            .await
            .unwrap();
        let connectivity = Connectivity::new(false);
        let queue = OperationQueue::new(&db, pipeline.clone(), connectivity.clone(), 3);

        let letters = Arc::new(StdMutex::new(Vec::new()));
        let letters2 = Arc::clone(&letters);
        let _sub = queue.on_dead_letter(move |d| letters2.lock().unwrap().push(d.clone()));

        queue
            .enqueue(post("/forbidden").priority(Priority::High))
            .await
            .unwrap();
        queue
            .enqueue(post("/unrelated").priority(Priority::Low))
            .await
            .unwrap();
        connectivity.set_online(true);

        let first = queue.drain().await.unwrap();
        assert!(first.halted.is_none());
        assert_eq!(first.failed, 1);
        assert_eq!(first.succeeded, 1);
        assert!(server.delivered().contains(&"POST /unrelated".to_string()));

        for _ in 0..5 {
            queue.drain().await.unwrap();
        }

        assert_eq!(queue.status().await.unwrap().pending_count, 0);
        let letters = letters.lock().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].operation.target.path, "/forbidden");
        assert_eq!(letters[0].operation.retry_count, 3);

        // One refresh per attempt, and the session is still usable.
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline.state().await, crate::auth::AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_concurrent_drains_share_one_pass() {
        let server = Arc::new(ScriptedServer {
            delay: Some(Duration::from_millis(30)),
            ..ScriptedServer::default()
        });
        let (queue, connectivity) = setup(server.clone(), true).await;

        queue.enqueue(post("/a")).await.unwrap();
        queue.enqueue(post("/b")).await.unwrap();
        connectivity.set_online(true);

        let (first, second) = tokio::join!(queue.drain(), queue.drain());
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first, second);
        assert_eq!(first.succeeded, 2);
        assert_eq!(server.delivered().len(), 2);
        assert!(!queue.is_draining());
    }

    #[tokio::test]
    async fn test_request_stop_ends_pass_after_current_operation() {
        let server = Arc::new(ScriptedServer::default());
        let (queue, connectivity) = setup(server.clone(), true).await;
        *server.stop_after_first.lock().unwrap() = Some(queue.clone());

        queue.enqueue(post("/a")).await.unwrap();
        queue.enqueue(post("/b")).await.unwrap();
        connectivity.set_online(true);

        let report = queue.drain().await.unwrap();
        assert!(report.stopped);
        assert_eq!(report.succeeded, 1);
        assert_eq!(server.delivered(), vec!["POST /a"]);

        // A fresh pass picks up where the stopped one left off.
        let report = queue.drain().await.unwrap();
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn test_status_events_track_syncing() {
        let server = Arc::new(ScriptedServer::default());
        let (queue, connectivity) = setup(server, true).await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _sub = queue.on_status_change(move |s| seen2.lock().unwrap().push(s.clone()));

        queue.enqueue(post("/a")).await.unwrap();
        connectivity.set_online(true);
        queue.drain().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].pending_count, 1);
        assert!(seen.iter().any(|s| s.is_syncing));
        let last = seen.last().unwrap();
        assert!(!last.is_syncing);
        assert!(last.last_sync_time.is_some());
        assert_eq!(last.pending_count, 0);
    }

    #[tokio::test]
    async fn test_status_published_after_each_operation() {
        let server = Arc::new(ScriptedServer::default());
        server.respond("/fail", HttpResponse::new(500));
        let (queue, connectivity) = setup(server, true).await;

        queue.enqueue(post("/a")).await.unwrap();
        queue.enqueue(post("/b")).await.unwrap();
        queue.enqueue(post("/fail").max_retries(1)).await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _sub = queue.on_status_change(move |s| seen2.lock().unwrap().push(s.clone()));

        connectivity.set_online(true);
        queue.drain().await.unwrap();

        let seen = seen.lock().unwrap();
        let mut during: Vec<(u64, u64)> = seen
            .iter()
            .filter(|s| s.is_syncing)
            .map(|s| (s.pending_count, s.sync_error_count))
            .collect();
        during.dedup();
        assert_eq!(during, vec![(3, 0), (2, 0), (1, 0), (0, 1)]);
    }

    #[tokio::test]
    async fn test_clear_pending_and_close() {
        let server = Arc::new(ScriptedServer::default());
        let (queue, _) = setup(server, true).await;

        queue.enqueue(post("/a")).await.unwrap();
        queue.enqueue(post("/b")).await.unwrap();
        assert_eq!(queue.clear_pending().await.unwrap(), 2);

        queue.close().await;
        assert_eq!(queue.enqueue(post("/c")).await.unwrap_err(), SyncError::ShuttingDown);
        assert_eq!(queue.drain().await.unwrap_err(), SyncError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_enqueue_while_online_drains_in_background() {
        let server = Arc::new(ScriptedServer::default());
        let (queue, connectivity) = setup(server.clone(), true).await;
        connectivity.set_online(true);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let _sub = queue.on_status_change(move |s| {
            if s.pending_count == 0 && s.last_sync_time.is_some() {
                calls2.fetch_add(1, Ordering::SeqCst);
            }
        });

        queue.enqueue(post("/a")).await.unwrap();
        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(server.delivered(), vec!["POST /a"]);
    }
}
