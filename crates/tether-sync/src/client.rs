//! # Tether Client
//!
//! The one object a host application holds. Owns the durable store, the
//! auth pipeline, the queue, the cache and the scheduler task.
//!
//! ## Wiring
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           TetherClient                                  │
//! │                                                                         │
//! │  host ──► enqueue ────────► OperationQueue ──► AuthPipeline ──► HTTP   │
//! │  host ──► read_through ───► ResponseCache ─┐        ▲                   │
//! │                              (on miss) ────┴────────┘                   │
//! │                                                                         │
//! │  host ──► set_online / app_foreground ──► SyncScheduler ──► drain()    │
//! │                                                                         │
//! │  AuthPipeline ── session ended ──► SessionEndPolicy                     │
//! │                                     keep:    leave queue and cache      │
//! │                                     discard: clear queue and cache      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{AuthPipeline, AuthState, HttpTokenRefresher, SessionEndReason, SessionEnded, TokenRefresher};
use crate::cache::ResponseCache;
use crate::config::{SessionEndPolicy, TetherConfig};
use crate::error::{SyncError, SyncResult};
use crate::events::Subscription;
use crate::queue::{DrainReport, OperationQueue};
use crate::scheduler::{SchedulerHandle, SchedulerState, SyncScheduler};
use crate::transport::{Connectivity, HttpRequest, HttpTransport, ReqwestTransport};
use crate::vault::{EncryptedFileVault, MemoryVault, SessionStore};
use tether_core::{AuthSession, CacheOptions, DeadLetter, PendingOperationInput, SyncStatus};
use tether_db::{Database, DbConfig};

// =============================================================================
// Client
// =============================================================================

/// Client-side resilience core.
pub struct TetherClient {
    config: TetherConfig,
    db: Database,
    connectivity: Connectivity,
    pipeline: AuthPipeline,
    queue: OperationQueue,
    cache: ResponseCache,
    scheduler: SchedulerHandle,
    closed: AtomicBool,
    _session_policy: Subscription,
}

impl TetherClient {
    /// Opens a client with production transport and vault.
    pub async fn open(config: TetherConfig) -> SyncResult<Self> {
        TetherClientBuilder::new(config).open().await
    }

    pub fn builder(config: TetherConfig) -> TetherClientBuilder {
        TetherClientBuilder::new(config)
    }

    /// Stops the scheduler, lets a running drain finish, and closes the store.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.scheduler.shutdown().await;
        self.queue.close().await;
        self.db.close().await;
        info!("Tether client closed");
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    // =========================================================================
    // Queue
    // =========================================================================

    /// Queues a mutation for delivery. Returns its id.
    pub async fn enqueue(&self, request: PendingOperationInput) -> SyncResult<String> {
        self.ensure_open()?;
        self.queue.enqueue(request).await
    }

    /// Runs a drain pass now and waits for it.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        self.ensure_open()?;
        self.queue.drain().await
    }

    pub async fn status(&self) -> SyncResult<SyncStatus> {
        self.queue.status().await
    }

    pub async fn acknowledge_errors(&self) {
        self.queue.acknowledge_errors().await;
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub async fn read_through<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: CacheOptions,
    ) -> SyncResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<Value>>,
    {
        self.ensure_open()?;
        self.cache.read_through(key, fetch, options).await
    }

    /// GETs `path` through the auth pipeline and decodes the JSON body.
    pub async fn fetch_json(&self, path: &str) -> SyncResult<Value> {
        self.ensure_open()?;
        self.pipeline
            .send(HttpRequest::get(path))
            .await?
            .error_for_status()?
            .json()
    }

    /// [`fetch_json`](Self::fetch_json) behind the cache, keyed by path.
    pub async fn fetch_json_cached(&self, path: &str, options: CacheOptions) -> SyncResult<Value> {
        self.read_through(path, || self.fetch_json(path), options).await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Calls `listener` with the current status now, then on every change.
    pub async fn on_status_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        let forward = Arc::clone(&listener);
        let subscription = self.queue.on_status_change(move |status| forward(status));

        let current = match self.queue.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Status unavailable; using last known");
                self.queue.last_status()
            }
        };
        listener(&current);

        subscription
    }

    pub fn on_dead_letter<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DeadLetter) + Send + Sync + 'static,
    {
        self.queue.on_dead_letter(listener)
    }

    pub fn on_session_ended<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionEnded) + Send + Sync + 'static,
    {
        self.pipeline.on_session_ended(listener)
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Installs a session and retries anything that was waiting on credentials.
    pub async fn sign_in(&self, session: AuthSession) -> SyncResult<()> {
        self.ensure_open()?;
        self.pipeline.sign_in(session).await?;
        self.scheduler.sync_now();
        Ok(())
    }

    pub async fn sign_out(&self) -> SyncResult<()> {
        self.pipeline.sign_out().await
    }

    pub async fn session(&self) -> Option<AuthSession> {
        self.pipeline.session().await
    }

    pub async fn auth_state(&self) -> AuthState {
        self.pipeline.state().await
    }

    // =========================================================================
    // Connectivity & Lifecycle
    // =========================================================================

    /// Reports connectivity. Going online triggers a drain.
    pub async fn set_online(&self, online: bool) {
        if self.connectivity.set_online(online) {
            self.queue.publish_status().await;
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn app_foreground(&self) {
        self.scheduler.app_foreground();
    }

    pub fn app_background(&self) {
        self.scheduler.app_background();
    }

    /// Requests a drain; coalesced if one is already running.
    pub fn sync_now(&self) {
        self.scheduler.sync_now();
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub async fn health_check(&self) -> bool {
        self.db.health_check().await
    }

    /// `(total, applied)` embedded migrations.
    pub async fn migration_status(&self) -> SyncResult<(usize, usize)> {
        Ok(self.db.migration_status().await?)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`TetherClient`]. Anything not supplied is built from the config.
pub struct TetherClientBuilder {
    config: TetherConfig,
    db: Option<Database>,
    transport: Option<Arc<dyn HttpTransport>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    vault: Option<Arc<dyn SessionStore>>,
    online: bool,
}

impl TetherClientBuilder {
    pub fn new(config: TetherConfig) -> Self {
        TetherClientBuilder {
            config,
            db: None,
            transport: None,
            refresher: None,
            vault: None,
            online: false,
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn SessionStore>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Initial connectivity. Defaults to offline until the host reports otherwise.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    fn default_vault(config: &TetherConfig) -> SyncResult<Arc<dyn SessionStore>> {
        match &config.storage.session_key {
            Some(key) => Ok(Arc::new(EncryptedFileVault::from_hex_key(
                &config.storage.session_path,
                key,
            )?)),
            None => {
                warn!("No session key configured; sessions will not survive a restart");
                Ok(Arc::new(MemoryVault::new()))
            }
        }
    }

    pub async fn open(self) -> SyncResult<TetherClient> {
        let config = self.config;
        config.validate()?;

        let db = match self.db {
            Some(db) => db,
            None => Database::new(DbConfig::new(&config.storage.database_path)).await?,
        };

        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&config)?),
        };
        let refresher: Arc<dyn TokenRefresher> = match self.refresher {
            Some(refresher) => refresher,
            None => Arc::new(HttpTokenRefresher::new(
                Arc::clone(&transport),
                config.api.refresh_path.clone(),
            )),
        };
        let vault = match self.vault {
            Some(vault) => vault,
            None => Self::default_vault(&config)?,
        };

        let pipeline = AuthPipeline::new(transport, refresher, vault);
        if let Err(e) = pipeline.restore().await {
            warn!(error = %e, "Persisted session unreadable; starting signed out");
        }

        let connectivity = Connectivity::new(self.online);
        let queue = OperationQueue::new(
            &db,
            pipeline.clone(),
            connectivity.clone(),
            config.queue.default_max_retries,
        );
        let cache = ResponseCache::new(&db);

        let session_policy = install_session_policy(
            &pipeline,
            config.queue.session_end_policy,
            queue.clone(),
            cache.clone(),
        );

        let scheduler = SyncScheduler::spawn(
            queue.clone(),
            cache.clone(),
            connectivity.clone(),
            config.sync_interval(),
        );

        info!(
            database = %config.storage.database_path.display(),
            online = self.online,
            policy = %config.queue.session_end_policy,
            "Tether client opened"
        );

        Ok(TetherClient {
            config,
            db,
            connectivity,
            pipeline,
            queue,
            cache,
            scheduler,
            closed: AtomicBool::new(false),
            _session_policy: session_policy,
        })
    }
}

/// Applies `policy` whenever a refresh failure ends the session.
fn install_session_policy(
    pipeline: &AuthPipeline,
    policy: SessionEndPolicy,
    queue: OperationQueue,
    cache: ResponseCache,
) -> Subscription {
    pipeline.on_session_ended(move |ended| {
        if ended.reason != SessionEndReason::RefreshFailed {
            return;
        }
        match policy {
            SessionEndPolicy::Keep => {
                info!("Session ended; pending operations kept for next sign-in");
            }
            SessionEndPolicy::Discard => {
                let queue = queue.clone();
                let cache = cache.clone();
                tokio::spawn(async move {
                    if let Err(e) = queue.clear_pending().await {
                        warn!(error = %e, "Failed to discard pending operations");
                    }
                    if let Err(e) = cache.clear().await {
                        warn!(error = %e, "Failed to clear cache");
                    }
                });
            }
        }
    })
}
