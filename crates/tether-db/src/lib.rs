//! # tether-db: Durable Store for Tether
//!
//! Local persistence for queued mutations and cached reads. Everything lives
//! in one SQLite file accessed through sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tether Data Flow                                 │
//! │                                                                         │
//! │  OperationQueue / ResponseCache (tether-sync)                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tether-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ PendingOpRepo │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ CacheEntryRepo│    │ 001_durable_ │  │   │
//! │  │   │               │    │      │        │    │   store.sql  │  │   │
//! │  │   └───────────────┘    └──────┼────────┘    └──────────────┘  │   │
//! │  │                               ▼                                 │   │
//! │  │                        DurableStore (store.rs)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (e.g. ~/.local/share/tether/tether.db)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`store`] - Generic keyed store with multi-entry indexes
//! - [`repository`] - Per-collection repositories
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/tether.db")).await?;
//! let pending = db.pending_operations().list_all().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use store::{DurableStore, IndexPredicate, StoredRecord};

// Repository re-exports for convenience
pub use repository::cache::CacheEntryRepository;
pub use repository::pending::PendingOperationRepository;
