//! # tether-sync: Resilience Engine for Tether
//!
//! Keeps an application usable across flaky networks and expiring
//! credentials: mutations are queued durably and replayed in order, reads
//! are cached with TTL and tags, and every outbound call goes through a
//! pipeline that renews credentials at most once at a time.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         TetherClient                                    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ SyncScheduler  │  │ OperationQueue │  │   ResponseCache        │    │
//! │  │                │  │                │  │                        │    │
//! │  │ online/offline │─►│ entity FIFO    │  │ TTL + tag invalidation │    │
//! │  │ foreground     │  │ retry budget   │  │ read-through           │    │
//! │  │ interval tick  │  │ dead letters   │  │                        │    │
//! │  └────────────────┘  └───────┬────────┘  └───────────┬────────────┘    │
//! │                              │                       │ (on miss)       │
//! │                              ▼                       ▼                  │
//! │                    ┌──────────────────────────────────────────┐        │
//! │                    │              AuthPipeline                │        │
//! │                    │  bearer token, single-flight refresh,    │        │
//! │                    │  replay-once on 401                      │        │
//! │                    └──────────────┬──────────────┬────────────┘        │
//! │                                   ▼              ▼                      │
//! │                          HttpTransport     SessionStore (vault)        │
//! │                          (reqwest)         (AES-256-GCM file)          │
//! │                                                                         │
//! │  Durable state: tether-db (SQLite) ─ pending_operations, cached_entries │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`client`] - `TetherClient` and its builder
//! - [`queue`] - Durable operation queue and drain passes
//! - [`cache`] - TTL/tag response cache
//! - [`auth`] - Authenticated request pipeline and token refresh
//! - [`scheduler`] - Connectivity and lifecycle driven drain scheduling
//! - [`transport`] - HTTP request/response types, reqwest transport, connectivity
//! - [`vault`] - Encrypted session storage
//! - [`events`] - Listener registry with unsubscribe handles
//! - [`config`] - Configuration loading
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_sync::{EnqueueRequest, TetherClient, TetherConfig};
//! use tether_core::{HttpMethod, Priority};
//!
//! let client = TetherClient::open(TetherConfig::load_or_default(None)).await?;
//!
//! let _status = client.on_status_change(|s| println!("pending: {}", s.pending_count)).await;
//!
//! client
//!     .enqueue(
//!         EnqueueRequest::new(HttpMethod::Patch, "/deals/42")
//!             .body(serde_json::json!({ "stage": "won" }))
//!             .priority(Priority::High)
//!             .entity("deal", "42"),
//!     )
//!     .await?;
//!
//! client.set_online(true).await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod queue;
pub mod scheduler;
pub mod transport;
pub mod vault;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{AuthPipeline, AuthState, HttpTokenRefresher, SessionEndReason, SessionEnded, TokenRefresher};
pub use cache::{CacheStats, ResponseCache};
pub use client::{TetherClient, TetherClientBuilder};
pub use config::{SessionEndPolicy, TetherConfig};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, Subscription};
pub use queue::{DrainReport, OperationQueue};
pub use scheduler::{SchedulerHandle, SchedulerState, SyncScheduler};
pub use transport::{Connectivity, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use vault::{EncryptedFileVault, MemoryVault, SessionStore};

/// Builder for a queued mutation.
pub use tether_core::PendingOperationInput as EnqueueRequest;
