//! Transaction manager for coordinating transaction lifecycle.
//!
//! Writes are deferred: a transaction buffers them in a private overlay and
//! nothing reaches the WAL or the index until commit. Commit is a single
//! critical section that validates, logs `Begin`, the writes and `Commit`
//! (durably, in that order), then applies the writes to the index while
//! readers of committed state are held off.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use super::id::{TransactionId, TransactionIdGenerator};
use super::state::{TransactionInfo, TransactionState};
use crate::access::{KeyStore, Mutation};
use crate::concurrency::mvcc::read_committed;
use crate::concurrency::{IsolationLevel, Timestamp, TimestampOracle, VersionStore};
use crate::error::{LowkeyError, Result};
use crate::storage::error::StorageResult;
use crate::storage::wal::{Lsn, WalManager, WalRecord};

struct TxContext {
    state: TransactionState,
    /// Keys read from committed state.
    read_set: HashSet<Vec<u8>>,
    /// Latest pending value per key, None for a delete.
    overlay: HashMap<Vec<u8>, Option<Vec<u8>>>,
    /// Writes in the order they were issued.
    writes: Vec<Mutation>,
}

/// Arena slot for one live transaction. Removed on commit or rollback.
struct TxEntry {
    isolation: IsolationLevel,
    start_ts: Timestamp,
    context: Mutex<TxContext>,
}

impl TxEntry {
    fn snapshot(&self) -> Option<Timestamp> {
        self.isolation.uses_snapshot().then_some(self.start_ts)
    }
}

pub struct TransactionManager {
    store: Arc<dyn KeyStore>,
    wal: Arc<WalManager>,
    versions: VersionStore,
    oracle: TimestampOracle,
    id_generator: TransactionIdGenerator,
    transactions: DashMap<TransactionId, Arc<TxEntry>>,
    /// Serializes validation, logging and apply of commits. Checkpoints
    /// hold it too.
    commit_lock: Mutex<()>,
    /// Shared by reads of committed state, exclusive while a commit is
    /// applied to the index.
    apply_latch: RwLock<()>,
    /// Set when a durable commit could not be applied to the index.
    poisoned: AtomicBool,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn KeyStore>, wal: Arc<WalManager>, next_transaction_id: u64) -> Self {
        Self {
            store,
            wal,
            versions: VersionStore::new(),
            oracle: TimestampOracle::new(),
            id_generator: TransactionIdGenerator::starting_at(next_transaction_id),
            transactions: DashMap::new(),
            commit_lock: Mutex::new(()),
            apply_latch: RwLock::new(()),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn begin(&self, isolation: IsolationLevel) -> TransactionId {
        let id = self.id_generator.next();
        // Registered before the latch is released, so a concurrent commit's
        // version pruning always sees this snapshot
        let _latch = self.apply_latch.read();
        let entry = TxEntry {
            isolation,
            start_ts: self.oracle.current(),
            context: Mutex::new(TxContext {
                state: TransactionState::Active,
                read_set: HashSet::new(),
                overlay: HashMap::new(),
                writes: Vec::new(),
            }),
        };
        self.transactions.insert(id, Arc::new(entry));
        log::trace!("begin {} ({})", id, isolation);
        id
    }

    pub fn get(&self, id: TransactionId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entry = self.entry(id)?;
        let mut ctx = entry.context.lock();
        Self::check_usable(id, &ctx)?;

        if let Some(pending) = ctx.overlay.get(key) {
            return Ok(pending.clone());
        }
        let value = self.read_committed(&entry, key)?;
        ctx.read_set.insert(key.to_vec());
        Ok(value)
    }

    pub fn put(&self, id: TransactionId, key: &[u8], value: &[u8]) -> Result<()> {
        self.store.check_entry(key, value)?;

        let entry = self.entry(id)?;
        let mut ctx = entry.context.lock();
        Self::check_usable(id, &ctx)?;

        ctx.overlay.insert(key.to_vec(), Some(value.to_vec()));
        ctx.writes.push(Mutation::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Buffers a delete. Fails with KeyNotFound if the key is absent from
    /// this transaction's view.
    pub fn delete(&self, id: TransactionId, key: &[u8]) -> Result<()> {
        let entry = self.entry(id)?;
        let mut ctx = entry.context.lock();
        Self::check_usable(id, &ctx)?;

        let exists = match ctx.overlay.get(key) {
            Some(pending) => pending.is_some(),
            None => {
                let value = self.read_committed(&entry, key)?;
                ctx.read_set.insert(key.to_vec());
                value.is_some()
            }
        };
        if !exists {
            return Err(LowkeyError::KeyNotFound);
        }

        ctx.overlay.insert(key.to_vec(), None);
        ctx.writes.push(Mutation::Delete { key: key.to_vec() });
        Ok(())
    }

    pub fn commit(&self, id: TransactionId) -> Result<()> {
        let entry = self.entry(id)?;
        let mut ctx = entry.context.lock();
        Self::check_usable(id, &ctx)?;

        // Read-only: a snapshot that wrote nothing has nothing to validate
        if ctx.writes.is_empty() {
            ctx.state = TransactionState::Committed;
            drop(ctx);
            self.transactions.remove(&id);
            return Ok(());
        }
        if self.is_poisoned() {
            return Err(LowkeyError::Generic(
                "writes are refused until the database is reopened".to_string(),
            ));
        }

        let _commit = self.commit_lock.lock();

        if entry.isolation.validates_reads() {
            let stale = ctx
                .read_set
                .iter()
                .find(|key| {
                    self.versions
                        .latest_commit(key)
                        .is_some_and(|ts| ts > entry.start_ts)
                })
                .cloned();
            if let Some(key) = stale {
                ctx.state = TransactionState::Conflicted;
                log::debug!(
                    "{} conflicts on key {:?}",
                    id,
                    String::from_utf8_lossy(&key)
                );
                return Err(LowkeyError::TransactionConflict(id));
            }
        }

        let commit_ts = self.oracle.current().next();
        if let Err(e) = self.log_commit(id, &ctx.writes, commit_ts) {
            log::error!("failed to log commit of {}: {}", id, e);
            self.log_rollback(id);
            ctx.state = TransactionState::RolledBack;
            drop(ctx);
            self.transactions.remove(&id);
            return Err(e.into());
        }

        let applied = self.apply_commit(&ctx, commit_ts);
        ctx.state = TransactionState::Committed;
        drop(ctx);
        self.transactions.remove(&id);
        self.versions.prune(self.oldest_snapshot());

        applied.map_err(|e| {
            self.poisoned.store(true, Ordering::SeqCst);
            log::error!("{} is durable but could not be applied: {}", id, e);
            LowkeyError::Generic(format!("{} is durable but could not be applied: {}", id, e))
        })
    }

    /// Discards the transaction's writes. Accepted for active and
    /// conflicted transactions.
    pub fn rollback(&self, id: TransactionId) -> Result<()> {
        let entry = self.entry(id)?;
        let mut ctx = entry.context.lock();
        if ctx.state.is_terminal() {
            return Err(LowkeyError::InvalidTransaction(id));
        }
        ctx.state = TransactionState::RolledBack;
        drop(ctx);
        self.transactions.remove(&id);
        log::trace!("rolled back {}", id);
        Ok(())
    }

    /// Rolls back every live transaction. Returns how many there were.
    pub fn rollback_all(&self) -> usize {
        let ids: Vec<TransactionId> = self.transactions.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.rollback(*id).is_ok())
            .count()
    }

    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        let entries: Vec<(TransactionId, Arc<TxEntry>)> = self
            .transactions
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        let mut infos: Vec<TransactionInfo> = entries
            .into_iter()
            .map(|(id, entry)| {
                let ctx = entry.context.lock();
                TransactionInfo {
                    id,
                    isolation: entry.isolation,
                    state: ctx.state,
                    start_ts: entry.start_ts,
                    reads: ctx.read_set.len(),
                    writes: ctx.writes.len(),
                }
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Latest committed value, outside any transaction.
    pub fn read_latest(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _latch = self.apply_latch.read();
        Ok(self.store.get(key)?)
    }

    pub fn key_count(&self) -> u64 {
        self.store.key_count()
    }

    /// Blocks commits until the guard is dropped.
    pub fn quiesce(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Id the next `begin` will hand out.
    pub fn next_transaction_id(&self) -> u64 {
        self.id_generator.peek()
    }

    pub fn version_count(&self) -> usize {
        self.versions.version_count()
    }

    fn entry(&self, id: TransactionId) -> Result<Arc<TxEntry>> {
        self.transactions
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(LowkeyError::InvalidTransaction(id))
    }

    fn check_usable(id: TransactionId, ctx: &TxContext) -> Result<()> {
        match ctx.state {
            TransactionState::Active => Ok(()),
            TransactionState::Conflicted => Err(LowkeyError::TransactionConflict(id)),
            TransactionState::Committed | TransactionState::RolledBack => {
                Err(LowkeyError::InvalidTransaction(id))
            }
        }
    }

    fn read_committed(&self, entry: &TxEntry, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _latch = self.apply_latch.read();
        Ok(read_committed(
            self.store.as_ref(),
            &self.versions,
            key,
            entry.snapshot(),
        )?)
    }

    fn log_commit(
        &self,
        id: TransactionId,
        writes: &[Mutation],
        commit_ts: Timestamp,
    ) -> StorageResult<()> {
        let tx = id.value();
        let mut last = self.wal.append(WalRecord::begin(tx))?;
        for mutation in writes {
            let record = match mutation {
                Mutation::Put { key, value } => WalRecord::put(tx, key.clone(), value.clone()),
                Mutation::Delete { key } => WalRecord::delete(tx, key.clone()),
            };
            last = self.wal.append(record)?;
        }
        // Data records are durable before the commit record is written
        self.wal.flush(last)?;

        let commit_lsn = self.wal.append(WalRecord::commit(tx, commit_ts.value()))?;
        self.wal.flush(commit_lsn)
    }

    fn log_rollback(&self, id: TransactionId) {
        let result = self
            .wal
            .append(WalRecord::rollback(id.value()))
            .and_then(|lsn: Lsn| self.wal.flush(lsn));
        if let Err(e) = result {
            log::warn!("could not log rollback of {}: {}", id, e);
        }
    }

    fn apply_commit(&self, ctx: &TxContext, commit_ts: Timestamp) -> StorageResult<()> {
        let _latch = self.apply_latch.write();
        for key in ctx.overlay.keys() {
            let previous = self.store.get(key)?;
            self.versions.record(key, commit_ts, previous);
        }
        self.store.apply(&ctx.writes)?;
        self.oracle.publish(commit_ts);
        Ok(())
    }

    fn oldest_snapshot(&self) -> Option<Timestamp> {
        self.transactions
            .iter()
            .filter_map(|e| e.value().snapshot())
            .min()
    }
}
