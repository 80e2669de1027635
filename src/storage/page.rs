pub mod bucket_page;
pub mod meta_page;

use crate::storage::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Page 0 always holds the meta page.
pub const META_PAGE_ID: PageId = PageId(0);

/// Discriminator stored in every page header. A zeroed page reads as `Unused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Unused = 0,
    Meta = 1,
    Bucket = 2,
}

impl PageType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => PageType::Meta,
            2 => PageType::Bucket,
            _ => PageType::Unused,
        }
    }
}

pub trait Page {
    fn page_id(&self) -> PageId;
    fn data(&self) -> &[u8; PAGE_SIZE];
    fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE];
}

pub use bucket_page::{BucketPage, BucketPageView};
pub use meta_page::MetaPage;
