//! # Domain Types
//!
//! Records that flow through the resilience core.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌──────────────────┐   ┌─────────────────┐   ┌─────────────────┐      │
//! │  │ PendingOperation │   │   CacheEntry    │   │   AuthSession   │      │
//! │  │ ──────────────── │   │  ─────────────  │   │  ─────────────  │      │
//! │  │ id (UUID)        │   │  key            │   │  access_token   │      │
//! │  │ target (verb+url)│   │  data (JSON)    │   │  refresh_token  │      │
//! │  │ body (JSON)      │   │  expires_at?    │   │  expires_at?    │      │
//! │  │ retry_count      │   │  version        │   │  profile (JSON) │      │
//! │  │ priority         │   │  tags           │   └─────────────────┘      │
//! │  │ entity?          │   └─────────────────┘                            │
//! │  └──────────────────┘                                                   │
//! │                                                                         │
//! │  ┌──────────────────┐   ┌─────────────────┐                            │
//! │  │    SyncStatus    │   │   DeadLetter    │                            │
//! │  │ (derived, never  │   │ (terminal event │                            │
//! │  │   persisted)     │   │  for an op)     │                            │
//! │  └──────────────────┘   └─────────────────┘                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::validation::{validate_cache_key, validate_operation_input};
use crate::DEFAULT_MAX_RETRIES;

// =============================================================================
// Priority
// =============================================================================

/// Delivery priority across entity groups.
///
/// Ordering is `Low < Medium < High`, so the derived `Ord` can be used
/// directly when picking the next group to drain.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, TS,
)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Stable string form, also used as the store index value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" | "normal" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(CoreError::UnknownPriority(other.to_string())),
        }
    }
}

// =============================================================================
// HTTP Target
// =============================================================================

/// HTTP verbs a queued mutation may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(CoreError::UnknownMethod(other.to_string())),
        }
    }
}

/// Method + endpoint path of a queued mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTarget {
    pub method: HttpMethod,
    /// Path relative to the configured API base URL.
    pub path: String,
}

impl fmt::Display for OperationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

// =============================================================================
// Entity Reference
// =============================================================================

/// The logical record an operation writes to.
///
/// Operations sharing an `EntityRef` are replayed in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        EntityRef {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// `type/id`, the value stored in the `entity` index.
    ///
    /// `%` and `/` inside either part are percent-escaped so distinct
    /// entities never share a key.
    pub fn index_key(&self) -> String {
        format!(
            "{}/{}",
            escape_key_part(&self.entity_type),
            escape_key_part(&self.entity_id)
        )
    }
}

fn escape_key_part(part: &str) -> String {
    part.replace('%', "%25").replace('/', "%2F")
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

// =============================================================================
// Pending Operation
// =============================================================================

/// Caller-supplied description of a mutation to enqueue.
///
/// ## Example
/// ```rust
/// use tether_core::{HttpMethod, PendingOperationInput, Priority};
///
/// let input = PendingOperationInput::new(HttpMethod::Patch, "/deals/42")
///     .header("X-Client", "tether")
///     .body(serde_json::json!({ "stage": "won" }))
///     .priority(Priority::High)
///     .entity("deal", "42");
/// assert_eq!(input.max_retries, None);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperationInput {
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub priority: Priority,
    pub entity: Option<EntityRef>,
    /// `None` lets the queue apply its configured default.
    pub max_retries: Option<u32>,
}

impl PendingOperationInput {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        PendingOperationInput {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            priority: Priority::default(),
            entity: None,
            max_retries: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity = Some(EntityRef::new(entity_type, entity_id));
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A queued mutation awaiting delivery.
///
/// ## Lifecycle
/// ```text
/// enqueue ──► pending ──► replay ok ──► deleted
///                │
///                └──► replay failed ──► retry_count += 1
///                                          │
///                       retry_count >= max_retries ──► dead-lettered
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub target: OperationTarget,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    pub enqueued_at: DateTime<Utc>,
    /// Insertion sequence assigned by the durable store. Not serialized.
    #[serde(skip)]
    pub sequence: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    #[serde(default)]
    pub entity: Option<EntityRef>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest time the next attempt may be made (server `Retry-After`).
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl PendingOperation {
    /// Validates the input and builds a fresh operation.
    pub fn from_input(input: PendingOperationInput, now: DateTime<Utc>) -> CoreResult<Self> {
        validate_operation_input(&input)?;

        Ok(PendingOperation {
            id: Uuid::new_v4().to_string(),
            target: OperationTarget {
                method: input.method,
                path: input.path,
            },
            headers: input.headers,
            body: input.body,
            enqueued_at: now,
            sequence: 0,
            retry_count: 0,
            max_retries: input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            priority: input.priority,
            entity: input.entity,
            last_error: None,
            not_before: None,
        })
    }

    /// Key that groups operations for ordering purposes.
    ///
    /// Operations without an entity are never grouped with each other, so
    /// each one gets a key of its own.
    pub fn group_key(&self) -> String {
        match &self.entity {
            Some(entity) => format!("entity:{}", entity.index_key()),
            None => format!("op:{}", self.id),
        }
    }

    /// Records a failed delivery attempt.
    ///
    /// Returns `true` when the retry budget is now exhausted.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        not_before: Option<DateTime<Utc>>,
    ) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.not_before = not_before;
        self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// True while a server-imposed `Retry-After` window is still open.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(false, |at| now < at)
    }
}

/// Terminal event for an operation that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The operation as it was when it was removed from the queue.
    pub operation: PendingOperation,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

// =============================================================================
// Cache Entry
// =============================================================================

/// Options for a cache write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Time-to-live; `None` means the entry never expires on its own.
    pub ttl: Option<std::time::Duration>,
    pub tags: BTreeSet<String>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: std::time::Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// A cached read result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data: serde_json::Value,
    pub stored_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Monotonic per key, starting at 1.
    pub version: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    /// Builds the entry that replaces `previous_version` (if any) for `key`.
    pub fn new(
        key: impl Into<String>,
        data: serde_json::Value,
        options: CacheOptions,
        now: DateTime<Utc>,
        previous_version: Option<u64>,
    ) -> CoreResult<Self> {
        let key = key.into();
        validate_cache_key(&key)?;

        let expires_at = match options.ttl {
            Some(ttl) => Some(
                chrono::Duration::from_std(ttl)
                    .ok()
                    .and_then(|offset| now.checked_add_signed(offset))
                    .ok_or(CoreError::TtlOutOfRange(ttl))?,
            ),
            None => None,
        };

        Ok(CacheEntry {
            key,
            data,
            stored_at: now,
            expires_at,
            version: previous_version.map_or(1, |v| v.saturating_add(1)),
            tags: options.tags,
        })
    }

    /// An entry is expired from the instant `expires_at` is reached.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Observable snapshot of the sync layer. Derived, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: u64,
    #[ts(as = "Option<String>")]
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Operations dead-lettered since the core was opened.
    pub sync_error_count: u64,
}

// =============================================================================
// Auth Session
// =============================================================================

/// Credentials for the signed-in identity.
///
/// Tokens are never printed by `Debug`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub profile: serde_json::Value,
}

impl AuthSession {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        AuthSession {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: None,
            profile: serde_json::Value::Null,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_profile(mut self, profile: serde_json::Value) -> Self {
        self.profile = profile;
        self
    }

    /// True once `expires_at` has passed. Sessions without an expiry never
    /// expire locally; the server's 401 is authoritative for them.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("profile", &self.profile)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_priority_order_and_parse() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn test_from_input_assigns_identity() {
        let now = Utc::now();
        let op = PendingOperation::from_input(
            PendingOperationInput::new(HttpMethod::Post, "/deals").entity("deal", "42"),
            now,
        )
        .unwrap();

        assert!(!op.id.is_empty());
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.max_retries, 3);
        assert_eq!(op.enqueued_at, now);
        assert_eq!(op.group_key(), "entity:deal/42");
    }

    #[test]
    fn test_entity_key_separator_is_unambiguous() {
        let left = EntityRef::new("a/b", "c");
        let right = EntityRef::new("a", "b/c");

        assert_ne!(left.index_key(), right.index_key());
        assert_eq!(left.index_key(), "a%2Fb/c");
        assert_ne!(
            EntityRef::new("a%2Fb", "c").index_key(),
            left.index_key()
        );
        assert_eq!(EntityRef::new("deal", "42").index_key(), "deal/42");
    }

    #[test]
    fn test_from_input_rejects_zero_retries() {
        let result = PendingOperation::from_input(
            PendingOperationInput::new(HttpMethod::Post, "/deals").max_retries(0),
            Utc::now(),
        );
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_entityless_operations_get_distinct_groups() {
        let now = Utc::now();
        let a = PendingOperation::from_input(PendingOperationInput::new(HttpMethod::Post, "/a"), now)
            .unwrap();
        let b = PendingOperation::from_input(PendingOperationInput::new(HttpMethod::Post, "/a"), now)
            .unwrap();
        assert_ne!(a.group_key(), b.group_key());
    }

    #[test]
    fn test_record_failure_exhausts_budget() {
        let mut op = PendingOperation::from_input(
            PendingOperationInput::new(HttpMethod::Put, "/x").max_retries(2),
            Utc::now(),
        )
        .unwrap();

        assert!(!op.record_failure("boom", None));
        assert!(op.record_failure("boom again", None));
        assert_eq!(op.retry_count, 2);
        assert_eq!(op.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn test_cache_entry_zero_ttl_is_expired_immediately() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            "k",
            serde_json::json!(1),
            CacheOptions::new().ttl(Duration::ZERO),
            now,
            None,
        )
        .unwrap();
        assert!(entry.is_expired(now));
        assert_eq!(entry.version, 1);
    }

    #[test]
    fn test_cache_entry_version_bumps() {
        let entry = CacheEntry::new("k", serde_json::json!(1), CacheOptions::new(), Utc::now(), Some(4))
            .unwrap();
        assert_eq!(entry.version, 5);
        assert!(!entry.is_expired(Utc::now()));
    }

    #[test]
    fn test_session_debug_redacts_tokens() {
        let session = AuthSession::new("secret-access", "secret-refresh");
        let printed = format!("{:?}", session);
        assert!(!printed.contains("secret-access"));
        assert!(!printed.contains("secret-refresh"));
    }

    #[test]
    fn test_operation_json_roundtrip_drops_sequence() {
        let mut op = PendingOperation::from_input(
            PendingOperationInput::new(HttpMethod::Delete, "/deals/1"),
            Utc::now(),
        )
        .unwrap();
        op.sequence = 9;

        let json = serde_json::to_string(&op).unwrap();
        let back: PendingOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sequence, 0);
        assert_eq!(back.id, op.id);
    }
}
