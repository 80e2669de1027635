use super::journal::{journal_path, PageJournal};
use crate::failpoint;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub const PAGE_SIZE: usize = 8192;

/// Page I/O against the data file.
///
/// Writes are staged in the page journal and reach the data file only at
/// [`PageManager::commit_journal`]. Page numbers are handed out from the
/// free set first (lowest number wins) and only then by growing the file.
pub struct PageManager {
    file: File,
    journal: PageJournal,
    free_pages: BTreeSet<PageId>,
}

impl PageManager {
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let journal = PageJournal::create(&journal_path(path))?;

        Ok(Self {
            file,
            journal,
            free_pages: BTreeSet::new(),
        })
    }

    /// Opens the data file, finishing or discarding a leftover journal.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(StorageError::Corrupted(format!(
                "file size {} is not a multiple of the page size {}",
                len, PAGE_SIZE
            )));
        }
        let (journal, _) = PageJournal::open(&journal_path(path), &mut file)?;

        Ok(Self {
            file,
            journal,
            free_pages: BTreeSet::new(),
        })
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        if buf.len() != PAGE_SIZE {
            return Err(StorageError::Corrupted(format!(
                "buffer size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                buf.len()
            )));
        }

        if self.journal.read(page_id, buf)? {
            return Ok(());
        }

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            return Err(StorageError::PageNotFound(page_id));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;

        Ok(())
    }

    /// Stages one page in the journal. It becomes part of the data file at
    /// the next [`PageManager::commit_journal`].
    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        if data.len() != PAGE_SIZE {
            return Err(StorageError::Corrupted(format!(
                "data size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        failpoint::maybe_fail(failpoint::PAGE_WRITE)?;

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        // Extend file if necessary
        if offset >= file_size {
            self.file.set_len(offset + PAGE_SIZE as u64)?;
        }

        self.journal.stage(page_id, data, &mut self.file)
    }

    /// Syncs staged pages to the journal file.
    pub fn sync(&mut self) -> StorageResult<()> {
        self.journal.sync()
    }

    /// Atomically moves every staged page into the data file. Returns the
    /// number of pages moved.
    pub fn commit_journal(&mut self) -> StorageResult<usize> {
        self.journal.commit(&mut self.file)
    }

    pub fn num_pages(&self) -> StorageResult<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    pub fn allocate_page(&mut self) -> StorageResult<PageId> {
        if let Some(page_id) = self.free_pages.pop_first() {
            return Ok(page_id);
        }

        let current_pages = self.num_pages()?;
        let new_page_id = PageId(current_pages);

        // Extend file to include new page
        let new_size = (current_pages as u64 + 1) * PAGE_SIZE as u64;
        self.file.set_len(new_size)?;

        Ok(new_page_id)
    }

    /// Returns a page number to the free set. Freed pages keep their bytes
    /// on disk until they are reused.
    pub fn deallocate_page(&mut self, page_id: PageId) {
        self.free_pages.insert(page_id);
    }

    pub fn free_page_count(&self) -> usize {
        self.free_pages.len()
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}
