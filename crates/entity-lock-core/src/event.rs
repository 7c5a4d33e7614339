//! Lock lifecycle events
//!
//! Published by the lock service on a broadcast channel. Subscribers that
//! fall behind lose the oldest events; publishing never blocks a lock call.

use crate::types::{EntityId, LockId, LockMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type of lock event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventType {
    /// The broker granted a lock
    Acquired,
    /// A held lock was released
    Released,
    /// The caller's deadline expired while waiting for the broker
    TimedOut,
    /// Resolution or a broker call failed
    Failed,
}

impl LockEventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquired => "lock_acquired",
            Self::Released => "lock_released",
            Self::TimedOut => "lock_timed_out",
            Self::Failed => "lock_failed",
        }
    }
}

impl std::fmt::Display for LockEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A lock lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// Type of event
    pub event_type: LockEventType,
    /// Entity the lock protects
    pub entity_id: EntityId,
    /// Resolved lock id, absent when resolution failed
    pub lock_id: Option<LockId>,
    /// Requested mode
    pub mode: LockMode,
    /// Lock scope (unit of work) that issued the call
    pub scope_id: Uuid,
    /// Time spent in the call that produced the event
    pub latency_ms: u64,
    /// Event data
    pub data: Option<serde_json::Value>,
    /// When the event occurred
    pub created_at: DateTime<Utc>,
}

impl LockEvent {
    fn new(
        event_type: LockEventType,
        scope_id: Uuid,
        entity_id: EntityId,
        lock_id: Option<LockId>,
        mode: LockMode,
        latency_ms: u64,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            entity_id,
            lock_id,
            mode,
            scope_id,
            latency_ms,
            data,
            created_at: Utc::now(),
        }
    }

    /// Create a lock acquired event
    pub fn acquired(
        scope_id: Uuid,
        entity_id: EntityId,
        lock_id: LockId,
        mode: LockMode,
        latency_ms: u64,
    ) -> Self {
        Self::new(
            LockEventType::Acquired,
            scope_id,
            entity_id,
            Some(lock_id),
            mode,
            latency_ms,
            None,
        )
    }

    /// Create a lock released event
    pub fn released(
        scope_id: Uuid,
        entity_id: EntityId,
        lock_id: LockId,
        mode: LockMode,
        latency_ms: u64,
        last_hold: bool,
    ) -> Self {
        let data = serde_json::json!({ "last_hold": last_hold });
        Self::new(
            LockEventType::Released,
            scope_id,
            entity_id,
            Some(lock_id),
            mode,
            latency_ms,
            Some(data),
        )
    }

    /// Create a deadline expiry event
    ///
    /// `lock_id` is `None` when the deadline expired before the entity resolved.
    pub fn timed_out(
        scope_id: Uuid,
        entity_id: EntityId,
        lock_id: Option<LockId>,
        mode: LockMode,
        waited_ms: u64,
    ) -> Self {
        Self::new(
            LockEventType::TimedOut,
            scope_id,
            entity_id,
            lock_id,
            mode,
            waited_ms,
            None,
        )
    }

    /// Create a failure event carrying the error code and message
    pub fn failed(
        scope_id: Uuid,
        entity_id: EntityId,
        lock_id: Option<LockId>,
        mode: LockMode,
        latency_ms: u64,
        error: &crate::error::LockError,
    ) -> Self {
        let data = serde_json::json!({
            "code": error.code(),
            "message": error.to_string(),
        });
        Self::new(
            LockEventType::Failed,
            scope_id,
            entity_id,
            lock_id,
            mode,
            latency_ms,
            Some(data),
        )
    }
}
