use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

use crate::access::{HashIndex, KeyStore};
use crate::concurrency::IsolationLevel;
use crate::config::DatabaseConfig;
use crate::error::{LowkeyError, Result};
use crate::recovery::{replay_wal, CheckpointConfig, CheckpointManager, CheckpointStats, RecoveryStats};
use crate::storage::buffer::lru::LruReplacer;
use crate::storage::wal::{Lsn, WalManager};
use crate::storage::{BufferPoolManager, BufferPoolStats, MetaPage, PageManager, META_PAGE_ID};
use crate::transaction::{TransactionId, TransactionInfo, TransactionManager};

/// An open database: one data file plus its WAL.
///
/// All methods take `&self`; share the handle across threads with an
/// `Arc`. After [`Database::close`] every operation fails with
/// InvalidParam.
pub struct Database {
    path: PathBuf,
    engine: RwLock<Option<Engine>>,
    recovery: RecoveryStats,
}

struct Engine {
    buffer_pool: BufferPoolManager,
    wal: Arc<WalManager>,
    transactions: Arc<TransactionManager>,
    checkpoints: CheckpointManager,
}

impl Database {
    /// Create a new database at the specified path
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with_config(path, DatabaseConfig::default())
    }

    pub fn create_with_config(path: &Path, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        if path.exists() {
            return Err(LowkeyError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("database file already exists at {}", path.display()),
            )));
        }

        let buffer_pool = Self::buffer_pool(PageManager::create(path)?, &config);
        {
            let (page_id, mut guard) = buffer_pool.new_page()?;
            if page_id != META_PAGE_ID {
                return Err(LowkeyError::Generic(format!(
                    "meta page allocated as {}",
                    page_id
                )));
            }
            MetaPage::new(config.bucket_count).write_to(&mut guard);
        }
        let index = Arc::new(HashIndex::create(buffer_pool.clone(), config.bucket_count)?);
        buffer_pool.flush_all()?;
        buffer_pool.commit_flushed()?;

        let wal = Arc::new(WalManager::create(path, config.wal.clone())?);
        let engine = Engine::assemble(buffer_pool, wal, index, 1, config);

        log::info!("created database at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            engine: RwLock::new(Some(engine)),
            recovery: RecoveryStats::default(),
        })
    }

    /// Open an existing database, replaying the WAL written since the last
    /// checkpoint.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, DatabaseConfig::default())
    }

    pub fn open_with_config(path: &Path, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;

        let buffer_pool = Self::buffer_pool(PageManager::open(path)?, &config);
        let meta = {
            let guard = buffer_pool.fetch_page(META_PAGE_ID)?;
            MetaPage::read_from(&guard)?
        };
        let index = Arc::new(HashIndex::open(buffer_pool.clone(), meta.bucket_count)?);

        let wal = Arc::new(WalManager::open(path, config.wal.clone())?);
        wal.advance_next_lsn(Lsn(meta.next_lsn));
        let recovery = replay_wal(&wal, index.as_ref(), Lsn(meta.checkpoint_lsn))?;

        let next_tx_id = meta.next_tx_id.max(recovery.max_transaction_id + 1);
        let engine = Engine::assemble(buffer_pool, wal, index, next_tx_id, config);
        if recovery.records_scanned > 0 {
            engine.checkpoints.checkpoint()?;
        }

        log::info!(
            "opened database at {}: {} keys, recovery scanned {} records, replayed {} transactions, discarded {}",
            path.display(),
            engine.transactions.key_count(),
            recovery.records_scanned,
            recovery.transactions_replayed,
            recovery.transactions_discarded
        );
        Ok(Self {
            path: path.to_path_buf(),
            engine: RwLock::new(Some(engine)),
            recovery,
        })
    }

    /// Stops automatic checkpointing, rolls back open transactions and
    /// checkpoints. Calling it again does nothing.
    pub fn close(&self) {
        let Some(engine) = self.engine.write().take() else {
            return;
        };
        engine.checkpoints.stop_auto();

        let rolled_back = engine.transactions.rollback_all();
        if rolled_back > 0 {
            log::warn!("rolled back {} open transactions on close", rolled_back);
        }
        if let Err(e) = engine.checkpoints.checkpoint() {
            log::warn!("final checkpoint failed, the WAL will be replayed on open: {}", e);
            if let Err(e) = engine.wal.flush_all() {
                log::error!("failed to flush WAL on close: {}", e);
            }
        }
        log::info!("closed database at {}", self.path.display());
    }

    pub fn is_closed(&self) -> bool {
        self.engine.read().is_none()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What recovery did when this handle was opened.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        let engine = self.engine()?;
        engine.autocommit(|tx| engine.transactions.put(tx, key, value))
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        self.engine()?
            .transactions
            .read_latest(key)?
            .ok_or(LowkeyError::KeyNotFound)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        let engine = self.engine()?;
        engine.autocommit(|tx| engine.transactions.delete(tx, key))
    }

    /// Number of live keys. Approximate while commits are in flight.
    pub fn key_count(&self) -> Result<u64> {
        Ok(self.engine()?.transactions.key_count())
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Result<TransactionId> {
        Ok(self.engine()?.transactions.begin(isolation))
    }

    pub fn commit(&self, tx: TransactionId) -> Result<()> {
        let engine = self.engine()?;
        engine.transactions.commit(tx)?;
        engine.checkpoints.note_wal_growth();
        Ok(())
    }

    pub fn rollback(&self, tx: TransactionId) -> Result<()> {
        self.engine()?.transactions.rollback(tx)
    }

    pub fn tx_put(&self, tx: TransactionId, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        self.engine()?.transactions.put(tx, key, value)
    }

    pub fn tx_get(&self, tx: TransactionId, key: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        self.engine()?
            .transactions
            .get(tx, key)?
            .ok_or(LowkeyError::KeyNotFound)
    }

    pub fn tx_delete(&self, tx: TransactionId, key: &[u8]) -> Result<()> {
        check_key(key)?;
        self.engine()?.transactions.delete(tx, key)
    }

    pub fn active_transactions(&self) -> Result<Vec<TransactionInfo>> {
        Ok(self.engine()?.transactions.active_transactions())
    }

    pub fn buffer_stats(&self) -> Result<BufferPoolStats> {
        Ok(self.engine()?.buffer_pool.stats())
    }

    pub fn checkpoint_stats(&self) -> Result<CheckpointStats> {
        Ok(self.engine()?.checkpoints.stats())
    }

    /// Sets the automatic checkpoint policy. Zero disables the matching
    /// trigger.
    pub fn configure_checkpointing(
        &self,
        interval_ms: u64,
        max_wal_size_mb: u32,
        max_archived_wals: u32,
    ) -> Result<()> {
        self.engine()?.checkpoints.configure(CheckpointConfig {
            interval: Duration::from_millis(interval_ms),
            max_wal_size: u64::from(max_wal_size_mb) * 1024 * 1024,
            max_archived_wals: max_archived_wals as usize,
        });
        Ok(())
    }

    pub fn start_auto_checkpoint(&self) -> Result<()> {
        self.engine()?.checkpoints.start_auto()
    }

    pub fn stop_auto_checkpoint(&self) -> Result<()> {
        self.engine()?.checkpoints.stop_auto();
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.engine()?.checkpoints.checkpoint()
    }

    /// Makes every appended WAL record durable.
    pub fn flush_wal(&self) -> Result<()> {
        Ok(self.engine()?.wal.flush_all()?)
    }

    fn engine(&self) -> Result<MappedRwLockReadGuard<'_, Engine>> {
        RwLockReadGuard::try_map(self.engine.read(), Option::as_ref)
            .map_err(|_| LowkeyError::InvalidParam("database is closed".to_string()))
    }

    fn buffer_pool(page_manager: PageManager, config: &DatabaseConfig) -> BufferPoolManager {
        BufferPoolManager::new(
            page_manager,
            Box::new(LruReplacer::new(config.buffer_pool_capacity)),
            config.buffer_pool_capacity,
            config.pin_wait_timeout,
        )
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

impl Engine {
    fn assemble(
        buffer_pool: BufferPoolManager,
        wal: Arc<WalManager>,
        index: Arc<HashIndex>,
        next_tx_id: u64,
        config: DatabaseConfig,
    ) -> Self {
        let bucket_count = index.bucket_count();
        let store: Arc<dyn KeyStore> = index;
        let transactions = Arc::new(TransactionManager::new(
            store,
            Arc::clone(&wal),
            next_tx_id,
        ));
        let checkpoints = CheckpointManager::new(
            buffer_pool.clone(),
            Arc::clone(&wal),
            Arc::clone(&transactions),
            bucket_count,
            config.checkpoint,
        );
        Self {
            buffer_pool,
            wal,
            transactions,
            checkpoints,
        }
    }

    /// Runs `op` in a read-committed transaction and commits it, rolling
    /// back if `op` fails.
    fn autocommit<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(TransactionId) -> Result<()>,
    {
        let tx = self.transactions.begin(IsolationLevel::ReadCommitted);
        if let Err(e) = op(tx) {
            let _ = self.transactions.rollback(tx);
            return Err(e);
        }
        self.transactions.commit(tx)?;
        self.checkpoints.note_wal_growth();
        Ok(())
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(LowkeyError::InvalidParam("key must not be empty".to_string()));
    }
    Ok(())
}
