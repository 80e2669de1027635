//! Storage layer for lowkeydb.
//!
//! Everything below the key-value index lives here:
//!
//! - **PageManager**: reads and writes fixed 8KB pages of the data file
//! - **BufferPoolManager**: bounded page cache with LRU eviction and pin guards
//! - **Pages**: the meta page (page 0) and slotted bucket pages
//! - **WAL**: append-only log of transactional changes with archive rotation

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{BufferPoolManager, BufferPoolStats, PageReadGuard, PageWriteGuard};
pub use disk::{PageManager, PAGE_SIZE};
pub use page::{BucketPage, BucketPageView, MetaPage, Page, PageId, META_PAGE_ID};
