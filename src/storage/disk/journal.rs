//! Page journal.
//!
//! Page writes are staged here instead of going to the data file. A
//! checkpoint seals the journal with a trailer, copies every staged page to
//! its home offset, syncs the data file and empties the journal. Opening
//! finishes a sealed journal and drops an unsealed one, so the data file
//! always holds the image of the last completed checkpoint.
//!
//! Layout: fixed-size slots of `[page_id u32][crc32 u32][page]`, followed by
//! an 8 byte trailer `[magic u32][slot count u32]` once sealed.

use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::page_manager::PAGE_SIZE;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;

const SLOT_HEADER_SIZE: usize = 8;
const SLOT_SIZE: u64 = (SLOT_HEADER_SIZE + PAGE_SIZE) as u64;
const TRAILER_SIZE: u64 = 8;
const TRAILER_MAGIC: u32 = 0x4c4b_4a4e;

/// Journal file that belongs to the data file at `db_path`.
pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push("-journal");
    PathBuf::from(name)
}

pub struct PageJournal {
    file: File,
    /// Slot offset of every staged page.
    slots: HashMap<PageId, u64>,
    next_slot: u64,
    sealed: bool,
}

impl PageJournal {
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::with_file(file))
    }

    /// Opens the journal and brings `data` to the last checkpoint image.
    /// Returns the journal and the number of pages copied into `data`.
    pub fn open(path: &Path, data: &mut File) -> StorageResult<(Self, usize)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let mut journal = Self::with_file(file);

        match journal.sealed_slot_count(len)? {
            Some(count) => {
                journal.load_slots(count)?;
                journal.sealed = true;
                let applied = journal.apply(data)?;
                log::info!("finished interrupted checkpoint: {} pages restored", applied);
                Ok((journal, applied))
            }
            None => {
                if len > 0 {
                    log::warn!(
                        "discarding {} bytes of unsealed page journal at {}",
                        len,
                        path.display()
                    );
                }
                journal.reset()?;
                Ok((journal, 0))
            }
        }
    }

    /// Copies the staged image of `page_id` into `buf`. Returns false when
    /// the page has no staged image.
    pub fn read(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<bool> {
        let Some(&offset) = self.slots.get(&page_id) else {
            return Ok(false);
        };
        self.read_slot(offset, buf)?;
        Ok(true)
    }

    /// Stages a page image. A page staged twice reuses its slot.
    pub fn stage(&mut self, page_id: PageId, data: &[u8], home: &mut File) -> StorageResult<()> {
        if self.sealed {
            // A previous commit got as far as the trailer; finish it first
            self.apply(home)?;
        }

        let offset = match self.slots.get(&page_id) {
            Some(&offset) => offset,
            None => {
                let offset = self.next_slot;
                self.next_slot += SLOT_SIZE;
                self.slots.insert(page_id, offset);
                offset
            }
        };

        let mut header = [0u8; SLOT_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], page_id.0);
        LittleEndian::write_u32(&mut header[4..8], crc32fast::hash(data));
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&header)?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Seals the journal and copies every staged page into `home`.
    /// Returns the number of pages copied.
    pub fn commit(&mut self, home: &mut File) -> StorageResult<usize> {
        if !self.sealed {
            if self.slots.is_empty() {
                return Ok(0);
            }
            self.seal()?;
        }
        self.apply(home)
    }

    fn with_file(file: File) -> Self {
        Self {
            file,
            slots: HashMap::new(),
            next_slot: 0,
            sealed: false,
        }
    }

    fn seal(&mut self) -> StorageResult<()> {
        let mut trailer = [0u8; TRAILER_SIZE as usize];
        LittleEndian::write_u32(&mut trailer[0..4], TRAILER_MAGIC);
        LittleEndian::write_u32(&mut trailer[4..8], (self.next_slot / SLOT_SIZE) as u32);

        self.file.seek(SeekFrom::Start(self.next_slot))?;
        self.file.write_all(&trailer)?;
        self.file.set_len(self.next_slot + TRAILER_SIZE)?;
        self.file.sync_all()?;
        self.sealed = true;
        Ok(())
    }

    fn apply(&mut self, home: &mut File) -> StorageResult<usize> {
        let mut staged: Vec<(PageId, u64)> = self.slots.iter().map(|(&p, &o)| (p, o)).collect();
        staged.sort_unstable();

        let mut buf = vec![0u8; PAGE_SIZE];
        for &(page_id, offset) in &staged {
            self.read_slot(offset, &mut buf)?;
            home.seek(SeekFrom::Start(page_id.0 as u64 * PAGE_SIZE as u64))?;
            home.write_all(&buf)?;
        }
        home.sync_all()?;

        self.reset()?;
        Ok(staged.len())
    }

    fn reset(&mut self) -> StorageResult<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.slots.clear();
        self.next_slot = 0;
        self.sealed = false;
        Ok(())
    }

    /// Slot count of a sealed journal of `len` bytes, or None when the
    /// journal carries no valid trailer.
    fn sealed_slot_count(&mut self, len: u64) -> StorageResult<Option<u64>> {
        if len < TRAILER_SIZE || (len - TRAILER_SIZE) % SLOT_SIZE != 0 {
            return Ok(None);
        }

        let mut trailer = [0u8; TRAILER_SIZE as usize];
        self.file.seek(SeekFrom::Start(len - TRAILER_SIZE))?;
        self.file.read_exact(&mut trailer)?;

        let magic = LittleEndian::read_u32(&trailer[0..4]);
        let count = LittleEndian::read_u32(&trailer[4..8]) as u64;
        if magic != TRAILER_MAGIC || count * SLOT_SIZE != len - TRAILER_SIZE {
            return Ok(None);
        }
        Ok(Some(count))
    }

    fn load_slots(&mut self, count: u64) -> StorageResult<()> {
        let mut buf = vec![0u8; PAGE_SIZE];
        for index in 0..count {
            let offset = index * SLOT_SIZE;
            let page_id = self.read_slot(offset, &mut buf)?;
            self.slots.insert(page_id, offset);
        }
        self.next_slot = count * SLOT_SIZE;
        Ok(())
    }

    fn read_slot(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<PageId> {
        let mut header = [0u8; SLOT_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut header)?;
        self.file.read_exact(buf)?;

        let page_id = PageId(LittleEndian::read_u32(&header[0..4]));
        let checksum = LittleEndian::read_u32(&header[4..8]);
        if crc32fast::hash(buf) != checksum {
            return Err(StorageError::Corrupted(format!(
                "journal slot for page {} failed its checksum",
                page_id
            )));
        }
        Ok(page_id)
    }
}
