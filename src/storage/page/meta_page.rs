use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageType;
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};

const MAGIC: &[u8; 8] = b"LOWKEYDB";
const FORMAT_VERSION: u32 = 1;

const MAGIC_OFFSET: usize = 0;
const PAGE_TYPE_OFFSET: usize = 8;
const VERSION_OFFSET: usize = 12;
const PAGE_SIZE_OFFSET: usize = 16;
const BUCKET_COUNT_OFFSET: usize = 20;
const CHECKPOINT_LSN_OFFSET: usize = 24;
const NEXT_LSN_OFFSET: usize = 32;
const NEXT_TX_ID_OFFSET: usize = 40;

/// Contents of page 0.
///
/// The meta page is rewritten only by a checkpoint, after every other dirty
/// page has been flushed, so `checkpoint_lsn` never runs ahead of the data
/// pages on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPage {
    pub bucket_count: u32,
    /// Every WAL record at or below this LSN is reflected in the data file.
    pub checkpoint_lsn: u64,
    pub next_lsn: u64,
    pub next_tx_id: u64,
}

impl MetaPage {
    pub fn new(bucket_count: u32) -> Self {
        Self {
            bucket_count,
            checkpoint_lsn: 0,
            next_lsn: 1,
            next_tx_id: 1,
        }
    }

    pub fn read_from(data: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        if &data[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()] != MAGIC {
            return Err(StorageError::Corrupted("bad magic in meta page".to_string()));
        }
        if PageType::from_byte(data[PAGE_TYPE_OFFSET]) != PageType::Meta {
            return Err(StorageError::Corrupted("page 0 is not a meta page".to_string()));
        }

        let version = LittleEndian::read_u32(&data[VERSION_OFFSET..]);
        if version != FORMAT_VERSION {
            return Err(StorageError::Corrupted(format!(
                "unsupported format version {}",
                version
            )));
        }
        let page_size = LittleEndian::read_u32(&data[PAGE_SIZE_OFFSET..]);
        if page_size as usize != PAGE_SIZE {
            return Err(StorageError::Corrupted(format!(
                "file uses page size {}, engine uses {}",
                page_size, PAGE_SIZE
            )));
        }

        let bucket_count = LittleEndian::read_u32(&data[BUCKET_COUNT_OFFSET..]);
        if bucket_count == 0 {
            return Err(StorageError::Corrupted("bucket count is zero".to_string()));
        }

        Ok(Self {
            bucket_count,
            checkpoint_lsn: LittleEndian::read_u64(&data[CHECKPOINT_LSN_OFFSET..]),
            next_lsn: LittleEndian::read_u64(&data[NEXT_LSN_OFFSET..]),
            next_tx_id: LittleEndian::read_u64(&data[NEXT_TX_ID_OFFSET..]),
        })
    }

    pub fn write_to(&self, data: &mut [u8; PAGE_SIZE]) {
        data.fill(0);
        data[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()].copy_from_slice(MAGIC);
        data[PAGE_TYPE_OFFSET] = PageType::Meta as u8;
        LittleEndian::write_u32(&mut data[VERSION_OFFSET..], FORMAT_VERSION);
        LittleEndian::write_u32(&mut data[PAGE_SIZE_OFFSET..], PAGE_SIZE as u32);
        LittleEndian::write_u32(&mut data[BUCKET_COUNT_OFFSET..], self.bucket_count);
        LittleEndian::write_u64(&mut data[CHECKPOINT_LSN_OFFSET..], self.checkpoint_lsn);
        LittleEndian::write_u64(&mut data[NEXT_LSN_OFFSET..], self.next_lsn);
        LittleEndian::write_u64(&mut data[NEXT_TX_ID_OFFSET..], self.next_tx_id);
    }
}
