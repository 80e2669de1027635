//! Transaction state tracking.

use super::id::TransactionId;
use crate::concurrency::{IsolationLevel, Timestamp};

/// The possible states of a transaction.
///
/// `Active -> Committed`, `Active -> RolledBack` or
/// `Active -> Conflicted -> RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// Failed serializable validation. Only `rollback` is accepted.
    Conflicted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Committed or rolled back; the id is no longer usable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committed => write!(f, "Committed"),
            Self::RolledBack => write!(f, "RolledBack"),
            Self::Conflicted => write!(f, "Conflicted"),
        }
    }
}

/// Snapshot of one live transaction, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub isolation: IsolationLevel,
    pub state: TransactionState,
    pub start_ts: Timestamp,
    pub reads: usize,
    pub writes: usize,
}
