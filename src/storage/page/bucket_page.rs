use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{Page, PageId, PageType};
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};

// Header structure (16 bytes)
const HEADER_SIZE: usize = 16;
const PAGE_ID_OFFSET: usize = 0;
const PAGE_TYPE_OFFSET: usize = 4;
const NEXT_PAGE_OFFSET: usize = 8;
const FREE_SPACE_POINTER_OFFSET: usize = 12;
const ENTRY_COUNT_OFFSET: usize = 14;

// Slot size (4 bytes: 2 for offset, 2 for length)
const SLOT_SIZE: usize = 4;

// Every entry starts with its key length
const KEY_LEN_SIZE: usize = 2;

/// Largest `key.len() + value.len()` that fits in an empty bucket page.
pub const MAX_ENTRY_PAYLOAD: usize = PAGE_SIZE - HEADER_SIZE - SLOT_SIZE - KEY_LEN_SIZE;

/// Read-only view of a slotted key/value page.
///
/// Entries are laid out as `[key_len u16][key][value]` growing from the
/// header, slots grow from the end of the page. Slots are kept dense: a
/// removal compacts the page.
pub struct BucketPageView<'a> {
    data: &'a [u8; PAGE_SIZE],
}

impl<'a> BucketPageView<'a> {
    pub fn new(data: &'a [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    /// A zeroed page (allocated but never flushed) is treated as an empty,
    /// unlinked bucket page.
    pub fn is_initialized(&self) -> bool {
        PageType::from_byte(self.data[PAGE_TYPE_OFFSET]) == PageType::Bucket
    }

    pub fn page_id(&self) -> PageId {
        PageId(LittleEndian::read_u32(&self.data[PAGE_ID_OFFSET..]))
    }

    pub fn next_page(&self) -> Option<PageId> {
        if !self.is_initialized() {
            return None;
        }
        match LittleEndian::read_u32(&self.data[NEXT_PAGE_OFFSET..]) {
            0 => None,
            id => Some(PageId(id)),
        }
    }

    pub fn entry_count(&self) -> u16 {
        if !self.is_initialized() {
            return 0;
        }
        LittleEndian::read_u16(&self.data[ENTRY_COUNT_OFFSET..])
    }

    fn free_space_pointer(&self) -> u16 {
        LittleEndian::read_u16(&self.data[FREE_SPACE_POINTER_OFFSET..])
    }

    pub fn free_space(&self) -> usize {
        if !self.is_initialized() {
            return PAGE_SIZE - HEADER_SIZE;
        }
        let slot_array_start = PAGE_SIZE - self.entry_count() as usize * SLOT_SIZE;
        slot_array_start.saturating_sub(self.free_space_pointer() as usize)
    }

    pub fn can_fit(&self, key_len: usize, value_len: usize) -> bool {
        self.free_space() >= BucketPage::required_space_for(key_len, value_len)
    }

    fn entry(&self, slot: u16) -> (&'a [u8], &'a [u8]) {
        let data: &'a [u8; PAGE_SIZE] = self.data;
        let slot_offset = PAGE_SIZE - (slot as usize + 1) * SLOT_SIZE;
        let offset = LittleEndian::read_u16(&data[slot_offset..]) as usize;
        let len = LittleEndian::read_u16(&data[slot_offset + 2..]) as usize;
        let record = &data[offset..offset + len];
        let key_len = LittleEndian::read_u16(record) as usize;
        (
            &record[KEY_LEN_SIZE..KEY_LEN_SIZE + key_len],
            &record[KEY_LEN_SIZE + key_len..],
        )
    }

    pub fn get(&self, key: &[u8]) -> Option<&'a [u8]> {
        (0..self.entry_count())
            .map(|slot| self.entry(slot))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn entries(&self) -> Vec<(&'a [u8], &'a [u8])> {
        (0..self.entry_count()).map(|slot| self.entry(slot)).collect()
    }
}

/// Mutable slotted key/value page, one link of a bucket chain.
pub struct BucketPage<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

impl<'a> BucketPage<'a> {
    pub fn new(data: &'a mut [u8; PAGE_SIZE], page_id: PageId) -> Self {
        data.fill(0);
        LittleEndian::write_u32(&mut data[PAGE_ID_OFFSET..], page_id.0);
        data[PAGE_TYPE_OFFSET] = PageType::Bucket as u8;
        LittleEndian::write_u16(&mut data[FREE_SPACE_POINTER_OFFSET..], HEADER_SIZE as u16);
        LittleEndian::write_u16(&mut data[ENTRY_COUNT_OFFSET..], 0);
        Self { data }
    }

    /// Wraps an existing page, formatting it first if it was never written.
    pub fn from_data(data: &'a mut [u8; PAGE_SIZE], page_id: PageId) -> Self {
        if !BucketPageView::new(&*data).is_initialized() {
            return Self::new(data, page_id);
        }
        Self { data }
    }

    pub fn view(&self) -> BucketPageView<'_> {
        BucketPageView::new(&*self.data)
    }

    pub fn required_space_for(key_len: usize, value_len: usize) -> usize {
        KEY_LEN_SIZE + key_len + value_len + SLOT_SIZE
    }

    pub fn set_next_page(&mut self, next: Option<PageId>) {
        let raw = next.map(|p| p.0).unwrap_or(0);
        LittleEndian::write_u32(&mut self.data[NEXT_PAGE_OFFSET..], raw);
    }

    /// Appends an entry. The caller guarantees the key is not already present.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let record_len = KEY_LEN_SIZE + key.len() + value.len();
        if record_len + SLOT_SIZE > PAGE_SIZE - HEADER_SIZE {
            return Err(StorageError::EntryTooLarge {
                required: key.len() + value.len(),
                max: MAX_ENTRY_PAYLOAD,
            });
        }
        if !self.view().can_fit(key.len(), value.len()) {
            return Err(StorageError::Corrupted(format!(
                "bucket page {} has {} free bytes, entry needs {}",
                self.view().page_id(),
                self.view().free_space(),
                record_len + SLOT_SIZE
            )));
        }

        let count = self.view().entry_count();
        let offset = self.view().free_space_pointer() as usize;

        LittleEndian::write_u16(&mut self.data[offset..], key.len() as u16);
        let key_start = offset + KEY_LEN_SIZE;
        self.data[key_start..key_start + key.len()].copy_from_slice(key);
        let value_start = key_start + key.len();
        self.data[value_start..value_start + value.len()].copy_from_slice(value);

        let slot_offset = PAGE_SIZE - (count as usize + 1) * SLOT_SIZE;
        LittleEndian::write_u16(&mut self.data[slot_offset..], offset as u16);
        LittleEndian::write_u16(&mut self.data[slot_offset + 2..], record_len as u16);

        LittleEndian::write_u16(
            &mut self.data[FREE_SPACE_POINTER_OFFSET..],
            (offset + record_len) as u16,
        );
        LittleEndian::write_u16(&mut self.data[ENTRY_COUNT_OFFSET..], count + 1);

        Ok(())
    }

    /// Removes `key` and compacts the page. Returns false if it was absent.
    pub fn remove(&mut self, key: &[u8]) -> StorageResult<bool> {
        let view = self.view();
        if view.get(key).is_none() {
            return Ok(false);
        }

        let page_id = view.page_id();
        let next = view.next_page();
        let survivors: Vec<(Vec<u8>, Vec<u8>)> = view
            .entries()
            .into_iter()
            .filter(|(k, _)| *k != key)
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();

        let mut page = BucketPage::new(&mut *self.data, page_id);
        page.set_next_page(next);
        for (k, v) in &survivors {
            page.insert(k, v)?;
        }

        Ok(true)
    }
}

impl<'a> Page for BucketPage<'a> {
    fn page_id(&self) -> PageId {
        self.view().page_id()
    }

    fn data(&self) -> &[u8; PAGE_SIZE] {
        &*self.data
    }

    fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut *self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_page_initialization() {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let page = BucketPage::new(&mut data, PageId(42));

        assert_eq!(page.page_id(), PageId(42));
        assert_eq!(page.view().entry_count(), 0);
        assert_eq!(page.view().next_page(), None);
        assert_eq!(page.view().free_space(), PAGE_SIZE - HEADER_SIZE);
    }

    #[test]
    fn test_zeroed_page_reads_empty() {
        let data = Box::new([0u8; PAGE_SIZE]);
        let view = BucketPageView::new(&data);

        assert!(!view.is_initialized());
        assert_eq!(view.entry_count(), 0);
        assert_eq!(view.next_page(), None);
        assert_eq!(view.get(b"anything"), None);
    }

    #[test]
    fn test_insert_and_get() -> StorageResult<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = BucketPage::new(&mut data, PageId(1));

        page.insert(b"alpha", b"one")?;
        page.insert(b"beta", b"")?;

        let view = page.view();
        assert_eq!(view.get(b"alpha"), Some(&b"one"[..]));
        assert_eq!(view.get(b"beta"), Some(&b""[..]));
        assert_eq!(view.get(b"gamma"), None);
        assert_eq!(view.entry_count(), 2);
        assert_eq!(
            view.free_space(),
            PAGE_SIZE
                - HEADER_SIZE
                - BucketPage::required_space_for(5, 3)
                - BucketPage::required_space_for(4, 0)
        );

        Ok(())
    }

    #[test]
    fn test_remove_compacts() -> StorageResult<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = BucketPage::new(&mut data, PageId(3));
        page.set_next_page(Some(PageId(9)));

        page.insert(b"a", b"1")?;
        page.insert(b"b", b"2")?;
        page.insert(b"c", b"3")?;
        let free_before = page.view().free_space();

        assert!(page.remove(b"b")?);
        assert!(!page.remove(b"b")?);

        let view = page.view();
        assert_eq!(view.entry_count(), 2);
        assert_eq!(view.get(b"a"), Some(&b"1"[..]));
        assert_eq!(view.get(b"c"), Some(&b"3"[..]));
        assert_eq!(view.next_page(), Some(PageId(9)));
        assert_eq!(view.page_id(), PageId(3));
        assert_eq!(
            view.free_space(),
            free_before + BucketPage::required_space_for(1, 1)
        );

        Ok(())
    }

    #[test]
    fn test_fill_page() -> StorageResult<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = BucketPage::new(&mut data, PageId(1));
        let value = vec![7u8; 100];

        let mut inserted = 0;
        loop {
            let key = format!("key{:04}", inserted);
            if !page.view().can_fit(key.len(), value.len()) {
                break;
            }
            page.insert(key.as_bytes(), &value)?;
            inserted += 1;
        }

        assert!(inserted > 70);
        assert_eq!(page.view().entry_count() as usize, inserted);
        assert!(page.insert(b"overflow", &value).is_err());

        Ok(())
    }

    #[test]
    fn test_max_entry() -> StorageResult<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = BucketPage::new(&mut data, PageId(1));

        let value = vec![1u8; MAX_ENTRY_PAYLOAD - 1];
        page.insert(b"k", &value)?;
        assert_eq!(page.view().free_space(), 0);

        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = BucketPage::new(&mut data, PageId(1));
        let too_big = vec![1u8; MAX_ENTRY_PAYLOAD];
        assert!(matches!(
            page.insert(b"k", &too_big),
            Err(StorageError::EntryTooLarge { .. })
        ));

        Ok(())
    }
}
