//! # tether-core: Pure Types for the Resilience Core
//!
//! Record types and rules shared by the durable store and the sync layer.
//! Nothing in here touches the disk or the network.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tether Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │          Callers (UI / business logic, out of scope)            │   │
//! │  │      enqueue(...)        read_through(...)      sign_in(...)    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │     tether-sync: Queue · Cache · Auth Pipeline · Scheduler      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tether-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ ordering  │  │validation │  │   error   │  │   │
//! │  │   │ Pending-  │  │ DrainPlan │  │  enqueue  │  │ CoreError │  │   │
//! │  │   │ Operation │  │ per-entity│  │   input   │  │           │  │   │
//! │  │   │ CacheEntry│  │   FIFO    │  │  checks   │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  tether-db (Durable Store)                      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - `PendingOperation`, `CacheEntry`, `SyncStatus`, `AuthSession`
//! - [`ordering`] - The drain order for pending operations
//! - [`validation`] - Enqueue-time validation
//! - [`error`] - Domain error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod ordering;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use ordering::DrainPlan;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Retry budget for an operation when the caller does not pick one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Durable store collection holding queued mutations.
pub const PENDING_OPERATIONS: &str = "pending_operations";

/// Durable store collection holding cached reads.
pub const CACHED_ENTRIES: &str = "cached_entries";
