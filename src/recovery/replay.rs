//! Redo-only WAL replay.
//!
//! Uncommitted writes never reach the data file, so recovery has nothing to
//! undo. It runs two passes over the records after the last checkpoint:
//! 1. Analysis: find transactions whose commit was later disowned by a
//!    rollback record
//! 2. Redo: reapply each committed transaction's writes when its commit
//!    record is reached, which is commit order
//!
//! Reapplying is idempotent: a put overwrites, a delete of an absent key is
//! a no-op.

use std::collections::{HashMap, HashSet};

use crate::access::{KeyStore, Mutation};
use crate::storage::error::StorageResult;
use crate::storage::wal::{Lsn, WalManager, WalRecordPayload};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Records after the checkpoint, counted once.
    pub records_scanned: usize,
    pub transactions_replayed: usize,
    /// Transactions without a commit record, or with a rollback record.
    pub transactions_discarded: usize,
    /// Highest transaction id in the scanned records, 0 if none.
    pub max_transaction_id: u64,
    /// LSN of the last scanned record.
    pub last_lsn: Lsn,
}

/// Replays every record with an LSN above `checkpoint_lsn` into `store`.
pub fn replay_wal(
    wal: &WalManager,
    store: &dyn KeyStore,
    checkpoint_lsn: Lsn,
) -> StorageResult<RecoveryStats> {
    let mut stats = RecoveryStats::default();
    let start = checkpoint_lsn.next();

    // Phase 1: Analysis
    let mut rolled_back = HashSet::new();
    for record in wal.iterate_from(start)? {
        let record = record?;
        stats.records_scanned += 1;
        stats.last_lsn = record.lsn();
        stats.max_transaction_id = stats.max_transaction_id.max(record.transaction_id());
        if record.payload == WalRecordPayload::Rollback {
            rolled_back.insert(record.transaction_id());
        }
    }

    // Phase 2: Redo
    let mut pending: HashMap<u64, Vec<Mutation>> = HashMap::new();
    for record in wal.iterate_from(start)? {
        let record = record?;
        let tx = record.transaction_id();
        match record.payload {
            WalRecordPayload::Begin => {
                pending.insert(tx, Vec::new());
            }
            WalRecordPayload::Put { key, value } => {
                pending.entry(tx).or_default().push(Mutation::Put { key, value });
            }
            WalRecordPayload::Delete { key } => {
                pending.entry(tx).or_default().push(Mutation::Delete { key });
            }
            WalRecordPayload::Commit { .. } => {
                let mutations = pending.remove(&tx).unwrap_or_default();
                if rolled_back.contains(&tx) {
                    stats.transactions_discarded += 1;
                    continue;
                }
                store.apply(&mutations)?;
                stats.transactions_replayed += 1;
            }
            WalRecordPayload::Rollback => {
                if pending.remove(&tx).is_some() {
                    stats.transactions_discarded += 1;
                }
            }
            WalRecordPayload::Checkpoint => {}
        }
    }

    // Never committed
    stats.transactions_discarded += pending.len();

    log::debug!(
        "replayed WAL from {}: {} records, {} transactions replayed, {} discarded",
        start,
        stats.records_scanned,
        stats.transactions_replayed,
        stats.transactions_discarded
    );
    Ok(stats)
}
