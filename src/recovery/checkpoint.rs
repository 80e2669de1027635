//! Checkpoint management.
//!
//! A checkpoint makes every applied commit durable in the data file and
//! then retires the WAL that covered it:
//! 1. Quiesce commits, so no transaction straddles the checkpoint
//! 2. Write back every dirty page, meta page last, into the page journal
//! 3. Append the checkpoint marker and make it durable
//! 4. Commit the page journal, which swaps in the new data file image
//! 5. Archive the live WAL and prune old archives
//!
//! Step 4 is the only point where the data file changes. Before it a crash
//! recovers from the previous image plus the whole live WAL; after it the
//! meta page skips every record up to the marker.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};

use crate::error::{LowkeyError, Result};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::{Lsn, WalManager, WalRecord};
use crate::storage::{BufferPoolManager, MetaPage, META_PAGE_ID};
use crate::transaction::TransactionManager;

/// Checkpoint policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Time between automatic checkpoints. Zero disables the timer.
    pub interval: Duration,
    /// Live WAL size that triggers an automatic checkpoint. Zero disables
    /// the size trigger.
    pub max_wal_size: u64,
    /// Archived WAL segments kept after a checkpoint.
    pub max_archived_wals: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_wal_size: 64 * 1024 * 1024,
            max_archived_wals: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub checkpoints_performed: u64,
    /// Pages moved into the data file by checkpoints, meta page included.
    pub pages_written: u64,
    /// Current live WAL size in bytes.
    pub wal_size: u64,
    /// Unix time in seconds of the last successful checkpoint, 0 if none.
    pub last_checkpoint_time: u64,
}

pub struct CheckpointManager {
    inner: Arc<CheckpointInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct CheckpointInner {
    buffer_pool: BufferPoolManager,
    wal: Arc<WalManager>,
    transactions: Arc<TransactionManager>,
    bucket_count: u32,
    config: Mutex<CheckpointConfig>,
    stats: Mutex<CheckpointStats>,
    /// Serializes checkpoints.
    run_lock: Mutex<()>,
    schedule: Mutex<Schedule>,
    wakeup: Condvar,
}

#[derive(Default)]
struct Schedule {
    running: bool,
    wal_pressure: bool,
}

impl CheckpointManager {
    pub fn new(
        buffer_pool: BufferPoolManager,
        wal: Arc<WalManager>,
        transactions: Arc<TransactionManager>,
        bucket_count: u32,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CheckpointInner {
                buffer_pool,
                wal,
                transactions,
                bucket_count,
                config: Mutex::new(config),
                stats: Mutex::new(CheckpointStats::default()),
                run_lock: Mutex::new(()),
                schedule: Mutex::new(Schedule::default()),
                wakeup: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Runs a checkpoint now, waiting for in-flight commits to finish.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoint()
    }

    pub fn config(&self) -> CheckpointConfig {
        self.inner.config.lock().clone()
    }

    /// Replaces the policy. A running worker picks up the new interval
    /// right away.
    pub fn configure(&self, config: CheckpointConfig) {
        log::debug!("checkpoint policy: {:?}", config);
        *self.inner.config.lock() = config;
        self.inner.wakeup.notify_all();
    }

    pub fn stats(&self) -> CheckpointStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.wal_size = self.inner.wal.size();
        stats
    }

    /// Starts the background worker. Does nothing if it is already running.
    pub fn start_auto(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        self.inner.schedule.lock().running = true;
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("lowkeydb-checkpoint".to_string())
            .spawn(move || inner.run_auto());
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                log::info!("automatic checkpointing started");
                Ok(())
            }
            Err(e) => {
                self.inner.schedule.lock().running = false;
                Err(LowkeyError::Io(e))
            }
        }
    }

    /// Stops the background worker, letting a checkpoint it is running
    /// finish first.
    pub fn stop_auto(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        {
            let mut schedule = self.inner.schedule.lock();
            schedule.running = false;
            schedule.wal_pressure = false;
        }
        self.inner.wakeup.notify_all();

        if handle.join().is_err() {
            log::error!("checkpoint worker panicked");
        }
        log::info!("automatic checkpointing stopped");
    }

    pub fn is_auto_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Wakes the worker early if the live WAL outgrew the configured limit.
    pub fn note_wal_growth(&self) {
        let max_wal_size = self.inner.config.lock().max_wal_size;
        if max_wal_size == 0 || self.inner.wal.size() <= max_wal_size {
            return;
        }

        let mut schedule = self.inner.schedule.lock();
        if schedule.running && !schedule.wal_pressure {
            schedule.wal_pressure = true;
            self.inner.wakeup.notify_all();
        }
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        self.stop_auto();
    }
}

impl CheckpointInner {
    fn checkpoint(&self) -> Result<()> {
        let _run = self.run_lock.lock();
        if self.transactions.is_poisoned() {
            return Err(LowkeyError::Generic(
                "checkpoint refused until the database is reopened".to_string(),
            ));
        }
        let _quiesced = self.transactions.quiesce();

        let max_archived = self.config.lock().max_archived_wals;
        let pages_written = self.flush_and_mark(max_archived).map_err(|e| {
            log::error!("checkpoint failed: {}", e);
            e
        })?;

        let mut stats = self.stats.lock();
        stats.checkpoints_performed += 1;
        stats.pages_written += pages_written;
        stats.last_checkpoint_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        log::info!(
            "checkpoint {} complete: {} pages written",
            stats.checkpoints_performed,
            pages_written
        );
        Ok(())
    }

    fn flush_and_mark(&self, max_archived: usize) -> StorageResult<u64> {
        let checkpoint_lsn = self.wal.next_lsn();

        self.buffer_pool.flush_all()?;
        self.write_meta(checkpoint_lsn)?;

        let marker = self.wal.append(WalRecord::checkpoint())?;
        if marker != checkpoint_lsn {
            return Err(StorageError::WalMismatch {
                expected: checkpoint_lsn.0,
                actual: marker.0,
            });
        }
        self.wal.flush(marker)?;

        let pages_written = self.buffer_pool.commit_flushed()? as u64;
        self.wal.archive_and_reset(marker, max_archived)?;
        Ok(pages_written)
    }

    fn write_meta(&self, checkpoint_lsn: Lsn) -> StorageResult<()> {
        let meta = MetaPage {
            bucket_count: self.bucket_count,
            checkpoint_lsn: checkpoint_lsn.0,
            next_lsn: checkpoint_lsn.next().0,
            next_tx_id: self.transactions.next_transaction_id(),
        };
        {
            let mut guard = self.buffer_pool.fetch_page_write(META_PAGE_ID)?;
            meta.write_to(&mut guard);
        }
        self.buffer_pool.flush_page(META_PAGE_ID)?;
        Ok(())
    }

    fn run_auto(&self) {
        loop {
            let mut schedule = self.schedule.lock();
            if !schedule.running {
                break;
            }

            let due = if schedule.wal_pressure {
                true
            } else {
                let interval = self.config.lock().interval;
                if interval.is_zero() {
                    self.wakeup.wait(&mut schedule);
                    false
                } else {
                    self.wakeup.wait_for(&mut schedule, interval).timed_out()
                }
            };
            if !schedule.running {
                break;
            }
            if !due && !schedule.wal_pressure {
                // Woken by a policy change
                continue;
            }
            schedule.wal_pressure = false;
            drop(schedule);

            if self.wal.size() == 0 {
                log::trace!("skipping automatic checkpoint, WAL is empty");
                continue;
            }
            if let Err(e) = self.checkpoint() {
                log::warn!("automatic checkpoint failed: {}", e);
            }
        }
    }
}
