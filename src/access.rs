//! Access layer: key/value lookups over pages.
//!
//! - **KeyStore**: the committed key/value state the transaction layer reads
//!   from and applies committed writes to
//! - **HashIndex**: the on-disk implementation, hashed buckets with chained
//!   overflow pages
//! - **Mutation**: one buffered write, as logged and as applied

pub mod hash_index;

pub use hash_index::HashIndex;

use crate::storage::error::StorageResult;

/// A single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Committed key/value state.
///
/// Writers are serialized by the caller; `get` may run concurrently with
/// other reads but not with `put`/`delete`.
pub trait KeyStore: Send + Sync {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Inserts or replaces. Returns true if the key was new.
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<bool>;

    /// Returns false if the key was absent.
    fn delete(&self, key: &[u8]) -> StorageResult<bool>;

    /// Number of live keys.
    fn key_count(&self) -> u64;

    /// Rejects an entry the store can never hold, before anything is logged.
    fn check_entry(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    fn apply(&self, mutations: &[Mutation]) -> StorageResult<()> {
        for mutation in mutations {
            match mutation {
                Mutation::Put { key, value } => {
                    self.put(key, value)?;
                }
                Mutation::Delete { key } => {
                    self.delete(key)?;
                }
            }
        }
        Ok(())
    }
}
