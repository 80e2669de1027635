//! WAL manager implementation.
//!
//! One live segment (`<db>-wal`) receives appends. A checkpoint renames it to
//! an archive named after the checkpoint LSN (`<db>-wal.<lsn>`) and starts a
//! fresh live segment; only the newest archives are retained.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use super::iterator::WalIterator;
use super::record::{decode_frame, FrameDecode, Lsn, WalRecord};
use crate::failpoint;
use crate::storage::error::StorageResult;

/// WAL manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalConfig {
    /// fsync the live segment on every flush. Without it a flush only
    /// reaches the OS.
    pub sync_on_commit: bool,
    /// Appends are buffered in memory up to this many bytes.
    pub buffer_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            sync_on_commit: true,
            buffer_size: 1024 * 1024,
        }
    }
}

/// Path of the live WAL segment for a data file.
pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}

struct WalInner {
    file: File,
    /// Appended frames not yet written to the file.
    buffer: BytesMut,
    next_lsn: Lsn,
    /// Bytes successfully written to the live segment.
    file_len: u64,
}

/// WAL manager for handling write-ahead logging.
pub struct WalManager {
    config: WalConfig,
    live_path: PathBuf,
    inner: Mutex<WalInner>,
    /// Highest LSN known to be on stable storage.
    durable_lsn: AtomicU64,
}

impl WalManager {
    /// Starts an empty log, discarding any segments left by an earlier
    /// database at the same path.
    pub fn create(db_path: &Path, config: WalConfig) -> StorageResult<Self> {
        let live_path = wal_path(db_path);
        for (_, archive) in list_archives(&live_path)? {
            fs::remove_file(archive)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&live_path)?;
        let file = reopen_for_append(file, &live_path)?;

        Ok(Self::with_file(config, live_path, file, 0, Lsn(1)))
    }

    /// Opens the live segment, creating it if missing, and cuts off a torn
    /// or corrupt tail left by a crash.
    pub fn open(db_path: &Path, config: WalConfig) -> StorageResult<Self> {
        let live_path = wal_path(db_path);
        let data = match fs::read(&live_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut valid_len = 0;
        let mut last_lsn = Lsn::INVALID;
        while let FrameDecode::Record(record, used) = decode_frame(&data[valid_len..]) {
            valid_len += used;
            last_lsn = last_lsn.max(record.lsn());
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&live_path)?;
        if valid_len < data.len() {
            log::warn!(
                "truncating {} bytes of torn WAL tail in {}",
                data.len() - valid_len,
                live_path.display()
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        let file = reopen_for_append(file, &live_path)?;

        Ok(Self::with_file(
            config,
            live_path,
            file,
            valid_len as u64,
            last_lsn.next(),
        ))
    }

    fn with_file(
        config: WalConfig,
        live_path: PathBuf,
        file: File,
        file_len: u64,
        next_lsn: Lsn,
    ) -> Self {
        let buffer = BytesMut::with_capacity(config.buffer_size);
        let durable_lsn = AtomicU64::new(next_lsn.0 - 1);
        WalManager {
            config,
            live_path,
            inner: Mutex::new(WalInner {
                file,
                buffer,
                next_lsn,
                file_len,
            }),
            durable_lsn,
        }
    }

    /// Assigns the next LSN to the record and buffers it. The record is
    /// durable only after a [`WalManager::flush`] covering its LSN.
    pub fn append(&self, mut record: WalRecord) -> StorageResult<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        record.header.lsn = lsn;
        record.encode_frame(&mut inner.buffer)?;
        inner.next_lsn = lsn.next();

        if inner.buffer.len() >= self.config.buffer_size {
            Self::write_buffer(&mut inner)?;
        }
        Ok(lsn)
    }

    /// Makes every record up to `up_to` durable. Records are written in
    /// append order, so this also covers everything before it.
    pub fn flush(&self, up_to: Lsn) -> StorageResult<()> {
        if up_to.0 <= self.durable_lsn.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        failpoint::maybe_fail(failpoint::WAL_FLUSH)?;
        Self::write_buffer(&mut inner)?;
        if self.config.sync_on_commit {
            inner.file.sync_data()?;
        }
        self.durable_lsn
            .store(inner.next_lsn.0 - 1, Ordering::Release);
        Ok(())
    }

    /// Flushes everything appended so far.
    pub fn flush_all(&self) -> StorageResult<()> {
        let last = Lsn(self.inner.lock().next_lsn.0 - 1);
        if last.is_invalid() {
            return Ok(());
        }
        self.flush(last)
    }

    /// LSN the next append will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    /// Moves the LSN counter forward to at least `lsn`.
    pub fn advance_next_lsn(&self, lsn: Lsn) {
        let mut inner = self.inner.lock();
        if lsn > inner.next_lsn {
            inner.next_lsn = lsn;
            self.durable_lsn.fetch_max(lsn.0 - 1, Ordering::AcqRel);
        }
    }

    pub fn durable_lsn(&self) -> Lsn {
        Lsn(self.durable_lsn.load(Ordering::Acquire))
    }

    /// Bytes in the live segment, buffered appends included.
    pub fn size(&self) -> u64 {
        let inner = self.inner.lock();
        inner.file_len + inner.buffer.len() as u64
    }

    /// Scans retained archives and then the live segment from `from`.
    pub fn iterate_from(&self, from: Lsn) -> StorageResult<WalIterator> {
        {
            let mut inner = self.inner.lock();
            Self::write_buffer(&mut inner)?;
        }

        let mut segments: Vec<PathBuf> = list_archives(&self.live_path)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        segments.push(self.live_path.clone());
        Ok(WalIterator::new(segments, from))
    }

    /// Closes the live segment as an archive named after `checkpoint_lsn`,
    /// starts an empty live segment and deletes the oldest archives beyond
    /// `max_archived`.
    pub fn archive_and_reset(&self, checkpoint_lsn: Lsn, max_archived: usize) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        failpoint::maybe_fail(failpoint::WAL_ROTATE)?;
        Self::write_buffer(&mut inner)?;
        inner.file.sync_all()?;

        let archive_path = archive_path(&self.live_path, checkpoint_lsn);
        fs::rename(&self.live_path, &archive_path)?;
        let file = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.live_path)
        {
            Ok(file) => file,
            Err(e) => {
                // Keep appending to the old segment under its live name
                if let Err(undo) = fs::rename(&archive_path, &self.live_path) {
                    log::error!("failed to restore live WAL after rotation error: {}", undo);
                }
                return Err(e.into());
            }
        };
        inner.file = file;
        inner.file_len = 0;
        log::info!(
            "archived WAL segment {} at {}",
            archive_path.display(),
            checkpoint_lsn
        );
        drop(inner);

        let archives = list_archives(&self.live_path)?;
        let excess = archives.len().saturating_sub(max_archived);
        for (_, path) in archives.into_iter().take(excess) {
            log::debug!("removing old WAL archive {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Retained archive paths, oldest first.
    pub fn archived_segments(&self) -> StorageResult<Vec<PathBuf>> {
        Ok(list_archives(&self.live_path)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    fn write_buffer(inner: &mut WalInner) -> StorageResult<()> {
        if inner.buffer.is_empty() {
            return Ok(());
        }

        let WalInner {
            file,
            buffer,
            file_len,
            ..
        } = inner;
        if let Err(e) = file.write_all(&buffer[..]) {
            // Drop any partial frame so a retry does not leave garbage
            // in the middle of the segment
            if let Err(truncate) = file.set_len(*file_len) {
                log::error!("failed to truncate WAL after write error: {}", truncate);
            }
            return Err(e.into());
        }
        *file_len += buffer.len() as u64;
        buffer.clear();
        Ok(())
    }
}

fn reopen_for_append(file: File, path: &Path) -> StorageResult<File> {
    drop(file);
    Ok(OpenOptions::new().append(true).open(path)?)
}

fn archive_path(live_path: &Path, checkpoint_lsn: Lsn) -> PathBuf {
    let mut name = live_path.as_os_str().to_owned();
    name.push(format!(".{:020}", checkpoint_lsn.0));
    PathBuf::from(name)
}

/// Archives belonging to `live_path`, sorted by checkpoint LSN.
fn list_archives(live_path: &Path) -> StorageResult<Vec<(u64, PathBuf)>> {
    let dir = match live_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(live_name) = live_path.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}.", live_name);

    let mut archives = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(lsn) = name
            .strip_prefix(&prefix)
            .and_then(|suffix| suffix.parse::<u64>().ok())
        {
            archives.push((lsn, entry.path()));
        }
    }
    archives.sort();
    Ok(archives)
}
