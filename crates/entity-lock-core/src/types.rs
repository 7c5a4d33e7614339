//! Identifier, mode, and state types shared across the crate

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Caller-supplied identifier of the entity being locked
pub type EntityId = Uuid;

/// Numeric key the broker locks on, assigned once per entity by the mapping store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(i64);

impl LockId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for LockId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Read lock; compatible with other shared holders
    Shared,
    /// Write lock; excludes every other holder
    Exclusive,
}

impl LockMode {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }

    /// Name of the public operation family for this mode
    pub fn access(&self) -> &'static str {
        match self {
            Self::Shared => "read",
            Self::Exclusive => "write",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of one logical lock usage inside a unit of work
///
/// `Idle -> Acquiring -> Held -> Releasing -> Idle`; `Failed` is terminal and
/// is entered when the broker errors or a deadline expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Releasing,
    Failed,
}

impl LockState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: LockState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Acquiring)
                | (Self::Held, Self::Acquiring)
                | (Self::Acquiring, Self::Held)
                | (Self::Held, Self::Releasing)
                | (Self::Releasing, Self::Idle)
                | (Self::Releasing, Self::Held)
                | (Self::Acquiring, Self::Failed)
                | (Self::Held, Self::Failed)
                | (Self::Releasing, Self::Failed)
        )
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Acquiring => write!(f, "acquiring"),
            Self::Held => write!(f, "held"),
            Self::Releasing => write!(f, "releasing"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
