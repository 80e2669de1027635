//! Snapshot visibility over the committed key/value state.

use std::fmt;
use std::str::FromStr;

use crate::access::KeyStore;
use crate::concurrency::timestamp::Timestamp;
use crate::concurrency::version::VersionStore;
use crate::storage::error::StorageResult;

/// Isolation levels supported by the transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Each read sees the latest committed value.
    ReadCommitted,
    /// All reads see the snapshot taken at begin.
    RepeatableRead,
    /// Repeatable read plus first-committer-wins validation of the read set.
    Serializable,
}

impl IsolationLevel {
    /// Whether this isolation level uses a consistent snapshot.
    pub fn uses_snapshot(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    /// Whether commit must validate the read set.
    pub fn validates_reads(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::ReadCommitted => "read-committed",
            IsolationLevel::RepeatableRead => "repeatable-read",
            IsolationLevel::Serializable => "serializable",
        };
        f.write_str(name)
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "read-committed" | "rc" => Ok(IsolationLevel::ReadCommitted),
            "repeatable-read" | "rr" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level '{}'", other)),
        }
    }
}

/// Reads the committed value of `key`, as of `snapshot` if given or the
/// latest otherwise. Callers hold off concurrent commits while reading.
pub fn read_committed(
    store: &dyn KeyStore,
    versions: &VersionStore,
    key: &[u8],
    snapshot: Option<Timestamp>,
) -> StorageResult<Option<Vec<u8>>> {
    if let Some(read_ts) = snapshot {
        if let Some(value) = versions.read_at(key, read_ts) {
            return Ok(value);
        }
    }
    store.get(key)
}
