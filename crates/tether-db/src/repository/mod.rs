//! # Repository Module
//!
//! Typed views over the durable store, one per collection.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  OperationQueue                       ResponseCache                     │
//! │       │                                    │                            │
//! │       │ db.pending_operations()            │ db.cache_entries()         │
//! │       ▼                                    ▼                            │
//! │  PendingOperationRepository           CacheEntryRepository              │
//! │  ├── insert / update / delete         ├── put / get / delete            │
//! │  ├── list_all (insertion order)       ├── delete_by_tags                │
//! │  └── list_for_entity                  └── delete_expired                │
//! │       │                                    │                            │
//! │       └──────────────┬─────────────────────┘                            │
//! │                      ▼                                                  │
//! │               DurableStore (JSON records + multi-entry indexes)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`PendingOperationRepository`](pending::PendingOperationRepository) - queued mutations
//! - [`CacheEntryRepository`](cache::CacheEntryRepository) - cached reads

pub mod cache;
pub mod pending;
