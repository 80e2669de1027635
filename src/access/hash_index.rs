use crate::access::KeyStore;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::bucket_page::MAX_ENTRY_PAYLOAD;
use crate::storage::page::{BucketPage, BucketPageView, PageId, META_PAGE_ID};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hashed key/value index over bucket pages.
///
/// Page `1 + crc32(key) % bucket_count` heads the key's bucket. When the head
/// fills up, overflow pages are chained through each page's next pointer.
/// A key lives in exactly one page of its chain.
pub struct HashIndex {
    buffer_pool: BufferPoolManager,
    bucket_count: u32,
    key_count: AtomicU64,
}

/// Where a key sits in its chain, found with read latches only.
struct ChainScan {
    pages: Vec<PageId>,
    /// Index into `pages` of the page holding the key.
    holder: Option<usize>,
}

impl HashIndex {
    /// Formats the bucket head pages of a new data file. The meta page must
    /// already be allocated so the heads land on pages `1..=bucket_count`.
    pub fn create(buffer_pool: BufferPoolManager, bucket_count: u32) -> StorageResult<Self> {
        for bucket in 0..bucket_count {
            let (page_id, mut guard) = buffer_pool.new_page()?;
            if page_id != PageId(bucket + 1) {
                return Err(StorageError::Corrupted(format!(
                    "bucket {} allocated page {}, expected {}",
                    bucket,
                    page_id,
                    bucket + 1
                )));
            }
            BucketPage::new(&mut guard, page_id);
        }

        Ok(Self {
            buffer_pool,
            bucket_count,
            key_count: AtomicU64::new(0),
        })
    }

    /// Walks every chain to count keys and hands every page no chain
    /// reaches back to the free set.
    pub fn open(buffer_pool: BufferPoolManager, bucket_count: u32) -> StorageResult<Self> {
        let num_pages = buffer_pool.num_pages()?;
        if num_pages <= bucket_count {
            return Err(StorageError::Corrupted(format!(
                "data file has {} pages, {} bucket heads expected",
                num_pages, bucket_count
            )));
        }

        let mut reachable = HashSet::new();
        let mut keys = 0u64;
        for bucket in 0..bucket_count {
            let mut next = Some(PageId(bucket + 1));
            while let Some(page_id) = next {
                if page_id == META_PAGE_ID || page_id.0 >= num_pages || !reachable.insert(page_id)
                {
                    return Err(StorageError::Corrupted(format!(
                        "bucket {} chain reaches invalid page {}",
                        bucket, page_id
                    )));
                }
                let guard = buffer_pool.fetch_page(page_id)?;
                let view = BucketPageView::new(&guard);
                keys += view.entry_count() as u64;
                next = view.next_page();
            }
        }

        let mut freed = 0;
        for raw in (bucket_count + 1)..num_pages {
            if !reachable.contains(&PageId(raw)) {
                buffer_pool.deallocate_page(PageId(raw));
                freed += 1;
            }
        }
        log::debug!(
            "hash index opened: {} keys in {} buckets, {} free pages",
            keys,
            bucket_count,
            freed
        );

        Ok(Self {
            buffer_pool,
            bucket_count,
            key_count: AtomicU64::new(keys),
        })
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    fn bucket_head(&self, key: &[u8]) -> PageId {
        PageId(1 + crc32fast::hash(key) % self.bucket_count)
    }

    fn scan_chain(&self, key: &[u8]) -> StorageResult<ChainScan> {
        let mut pages = Vec::new();
        let mut holder = None;
        let mut next = Some(self.bucket_head(key));
        while let Some(page_id) = next {
            let guard = self.buffer_pool.fetch_page(page_id)?;
            let view = BucketPageView::new(&guard);
            if holder.is_none() && view.get(key).is_some() {
                holder = Some(pages.len());
            }
            pages.push(page_id);
            next = view.next_page();
        }
        Ok(ChainScan { pages, holder })
    }

    fn insert_into_chain(&self, pages: &[PageId], key: &[u8], value: &[u8]) -> StorageResult<()> {
        for &page_id in pages {
            let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
            let mut page = BucketPage::from_data(&mut guard, page_id);
            if page.view().can_fit(key.len(), value.len()) {
                return page.insert(key, value);
            }
        }

        // Every page is full: link a new overflow page after the tail
        let tail = *pages.last().ok_or_else(|| {
            StorageError::Corrupted("bucket chain without a head page".to_string())
        })?;
        let (new_page_id, mut guard) = self.buffer_pool.new_page()?;
        BucketPage::new(&mut guard, new_page_id).insert(key, value)?;
        drop(guard);

        let mut tail_guard = self.buffer_pool.fetch_page_write(tail)?;
        BucketPage::from_data(&mut tail_guard, tail).set_next_page(Some(new_page_id));
        log::trace!("linked overflow page {} after {}", new_page_id, tail);
        Ok(())
    }
}

impl KeyStore for HashIndex {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let mut next = Some(self.bucket_head(key));
        while let Some(page_id) = next {
            let guard = self.buffer_pool.fetch_page(page_id)?;
            let view = BucketPageView::new(&guard);
            if let Some(value) = view.get(key) {
                return Ok(Some(value.to_vec()));
            }
            next = view.next_page();
        }
        Ok(None)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<bool> {
        self.check_entry(key, value)?;

        let scan = self.scan_chain(key)?;
        if let Some(idx) = scan.holder {
            let page_id = scan.pages[idx];
            let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
            let mut page = BucketPage::from_data(&mut guard, page_id);
            page.remove(key)?;
            // Common case: the new value fits where the old one was
            if page.view().can_fit(key.len(), value.len()) {
                return page.insert(key, value).map(|_| false);
            }
        }

        self.insert_into_chain(&scan.pages, key, value)?;
        let is_new = scan.holder.is_none();
        if is_new {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(is_new)
    }

    fn delete(&self, key: &[u8]) -> StorageResult<bool> {
        let scan = self.scan_chain(key)?;
        let Some(idx) = scan.holder else {
            return Ok(false);
        };

        let page_id = scan.pages[idx];
        let (now_empty, next) = {
            let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
            let mut page = BucketPage::from_data(&mut guard, page_id);
            page.remove(key)?;
            let view = page.view();
            (view.entry_count() == 0, view.next_page())
        };
        self.key_count.fetch_sub(1, Ordering::Relaxed);

        // Head pages stay put; an emptied overflow page is unlinked
        if now_empty && idx > 0 {
            let prev = scan.pages[idx - 1];
            let mut guard = self.buffer_pool.fetch_page_write(prev)?;
            BucketPage::from_data(&mut guard, prev).set_next_page(next);
            drop(guard);
            self.buffer_pool.deallocate_page(page_id);
            log::trace!("freed empty overflow page {}", page_id);
        }
        Ok(true)
    }

    fn key_count(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    fn check_entry(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let required = key.len() + value.len();
        if required > MAX_ENTRY_PAYLOAD {
            return Err(StorageError::EntryTooLarge {
                required,
                max: MAX_ENTRY_PAYLOAD,
            });
        }
        Ok(())
    }
}
