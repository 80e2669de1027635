//! Fixed-capacity page cache.
//!
//! Every page access goes through a pinned guard. While any guard for a
//! frame is alive the frame cannot be evicted; dropping the last guard hands
//! the frame to the replacer. A fetch that finds every frame pinned waits for
//! an unpin up to the configured timeout before failing.

pub mod lru;
pub mod replacer;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{PageId, PageManager, PAGE_SIZE};
use dashmap::DashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type PageData = Box<[u8; PAGE_SIZE]>;

struct Frame {
    data: Arc<RwLock<PageData>>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }
}

/// Frame bookkeeping that must change together.
struct PoolState {
    replacer: Box<dyn Replacer>,
    free_frames: Vec<FrameId>,
    /// frame -> page it currently holds
    resident: Vec<Option<PageId>>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
}

/// Point-in-time view of the buffer pool counters.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferPoolStats {
    pub capacity: usize,
    pub pages_in_buffer: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// hits / (hits + misses), 0.0 before the first fetch
    pub hit_ratio: f64,
    pub evictions: u64,
    pub write_backs: u64,
}

#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageId, FrameId>,
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    frame_available: Condvar,
    page_manager: Mutex<PageManager>,
    counters: Counters,
    pin_wait_timeout: Duration,
}

/// How a frame gets its contents on a miss.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Load {
    /// Read from disk and count the access.
    Fetch,
    /// Zero-fill a freshly allocated page.
    Fresh,
}

impl BufferPoolManager {
    pub fn new(
        page_manager: PageManager,
        replacer: Box<dyn Replacer>,
        max_frames: usize,
        pin_wait_timeout: Duration,
    ) -> Self {
        let max_frames = max_frames.max(1);
        let frames = (0..max_frames).map(|_| Frame::new()).collect();
        // Pop order hands out frame 0 first
        let free_frames = (0..max_frames as FrameId).rev().collect();

        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::with_capacity(max_frames),
                frames,
                state: Mutex::new(PoolState {
                    replacer,
                    free_frames,
                    resident: vec![None; max_frames],
                }),
                frame_available: Condvar::new(),
                page_manager: Mutex::new(page_manager),
                counters: Counters::default(),
                pin_wait_timeout,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.frames.len()
    }

    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageReadGuard> {
        let frame_id = self.pin_page(page_id, Load::Fetch)?;
        let pin = FramePin::new(self.inner.clone(), frame_id);
        let data = self.inner.frames[frame_id as usize].data.read_arc();
        Ok(PageReadGuard { data, _pin: pin })
    }

    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        let frame_id = self.pin_page(page_id, Load::Fetch)?;
        let pin = FramePin::new(self.inner.clone(), frame_id);
        let data = self.inner.frames[frame_id as usize].data.write_arc();
        Ok(PageWriteGuard {
            data,
            page_id,
            pin,
        })
    }

    /// Allocates a page number and returns a zeroed, pinned frame for it.
    pub fn new_page(&self) -> StorageResult<(PageId, PageWriteGuard)> {
        let page_id = self.inner.page_manager.lock().allocate_page()?;

        let frame_id = match self.pin_page(page_id, Load::Fresh) {
            Ok(frame_id) => frame_id,
            Err(e) => {
                self.inner.page_manager.lock().deallocate_page(page_id);
                return Err(e);
            }
        };
        let pin = FramePin::new(self.inner.clone(), frame_id);
        let mut data = self.inner.frames[frame_id as usize].data.write_arc();
        // A reused page number may still have a stale cached copy
        data.fill(0);

        Ok((
            page_id,
            PageWriteGuard {
                data,
                page_id,
                pin,
            },
        ))
    }

    /// Returns a page number to the free set. A cached copy stays until it
    /// is evicted or the number is handed out again.
    pub fn deallocate_page(&self, page_id: PageId) {
        self.inner.page_manager.lock().deallocate_page(page_id);
    }

    /// Writes the page back if it is cached and dirty, then syncs the
    /// journal. Returns whether a write happened.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        let written = self.write_back(page_id)?;
        if written {
            self.inner.page_manager.lock().sync()?;
        }
        Ok(written)
    }

    /// Writes back every dirty cached page and syncs the journal.
    /// Returns the number of pages written.
    pub fn flush_all(&self) -> StorageResult<usize> {
        let cached: Vec<PageId> = self.inner.page_table.iter().map(|e| *e.key()).collect();

        let mut written = 0;
        for page_id in cached {
            if self.write_back(page_id)? {
                written += 1;
            }
        }
        self.inner.page_manager.lock().sync()?;

        log::debug!("flushed {} dirty pages", written);
        Ok(written)
    }

    /// Makes every page written back so far part of the data file in one
    /// step. Returns the number of pages that moved.
    pub fn commit_flushed(&self) -> StorageResult<usize> {
        self.inner.page_manager.lock().commit_journal()
    }

    pub fn num_pages(&self) -> StorageResult<u32> {
        self.inner.page_manager.lock().num_pages()
    }

    pub fn free_page_count(&self) -> usize {
        self.inner.page_manager.lock().free_page_count()
    }

    pub fn stats(&self) -> BufferPoolStats {
        let counters = &self.inner.counters;
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        let hit_ratio = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        BufferPoolStats {
            capacity: self.capacity(),
            pages_in_buffer: self.inner.page_table.len(),
            cache_hits: hits,
            cache_misses: misses,
            hit_ratio,
            evictions: counters.evictions.load(Ordering::Relaxed),
            write_backs: counters.write_backs.load(Ordering::Relaxed),
        }
    }

    fn write_back(&self, page_id: PageId) -> StorageResult<bool> {
        // Pinning keeps the frame from being reassigned while we read it
        let Some(frame_id) = self.try_pin_resident(page_id) else {
            return Ok(false);
        };
        let _pin = FramePin::new(self.inner.clone(), frame_id);
        let frame = &self.inner.frames[frame_id as usize];

        let data = frame.data.read();
        if !frame.is_dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.page_manager.lock().write_page(page_id, &data[..])?;
        frame.is_dirty.store(false, Ordering::SeqCst);
        Ok(true)
    }

    /// Takes a pin on a cached page without touching the replacer.
    fn try_pin_resident(&self, page_id: PageId) -> Option<FrameId> {
        let entry = self.inner.page_table.get(&page_id)?;
        let frame_id = *entry.value();
        // Incremented while the shard guard is held, so eviction's
        // `remove_if` observes it
        self.inner.frames[frame_id as usize]
            .pin_count
            .fetch_add(1, Ordering::SeqCst);
        Some(frame_id)
    }

    fn pin_page(&self, page_id: PageId, load: Load) -> StorageResult<FrameId> {
        if let Some(frame_id) = self.try_pin_resident(page_id) {
            self.inner.state.lock().replacer.pin(frame_id);
            self.record_hit(load);
            return Ok(frame_id);
        }

        let deadline = Instant::now() + self.inner.pin_wait_timeout;
        let mut state = self.inner.state.lock();
        loop {
            // Another thread may have loaded it while we waited for the lock
            if let Some(frame_id) = self.try_pin_resident(page_id) {
                state.replacer.pin(frame_id);
                self.record_hit(load);
                return Ok(frame_id);
            }

            if let Some(frame_id) = self.take_frame(&mut state)? {
                if let Err(e) = self.load_frame(frame_id, page_id, load) {
                    state.free_frames.push(frame_id);
                    return Err(e);
                }
                state.resident[frame_id as usize] = Some(page_id);
                state.replacer.pin(frame_id);
                self.inner.page_table.insert(page_id, frame_id);
                if load == Load::Fetch {
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(frame_id);
            }

            if self
                .inner
                .frame_available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                log::warn!(
                    "buffer pool exhausted: all {} frames pinned for {:?}",
                    self.capacity(),
                    self.inner.pin_wait_timeout
                );
                return Err(StorageError::BufferPoolExhausted {
                    capacity: self.capacity(),
                });
            }
        }
    }

    fn record_hit(&self, load: Load) {
        if load == Load::Fetch {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn load_frame(&self, frame_id: FrameId, page_id: PageId, load: Load) -> StorageResult<()> {
        let frame = &self.inner.frames[frame_id as usize];
        let mut data = frame.data.write();
        match load {
            Load::Fetch => {
                self.inner
                    .page_manager
                    .lock()
                    .read_page(page_id, &mut data[..])?;
                frame.is_dirty.store(false, Ordering::SeqCst);
            }
            Load::Fresh => {
                data.fill(0);
                frame.is_dirty.store(true, Ordering::SeqCst);
            }
        }
        frame.pin_count.store(1, Ordering::SeqCst);
        Ok(())
    }

    /// Returns an empty frame, evicting the least recently used unpinned
    /// page if needed. `None` means every frame is pinned.
    fn take_frame(&self, state: &mut PoolState) -> StorageResult<Option<FrameId>> {
        if let Some(frame_id) = state.free_frames.pop() {
            return Ok(Some(frame_id));
        }

        while let Some(frame_id) = state.replacer.evict() {
            let frame = &self.inner.frames[frame_id as usize];
            let Some(victim) = state.resident[frame_id as usize] else {
                return Ok(Some(frame_id));
            };

            let removed = self
                .inner
                .page_table
                .remove_if(&victim, |_, _| frame.pin_count.load(Ordering::SeqCst) == 0)
                .is_some();
            if !removed {
                // Re-pinned through the fast path; its unpin re-registers it
                continue;
            }

            if frame.is_dirty.load(Ordering::SeqCst) {
                let data = frame.data.read();
                if let Err(e) = self
                    .inner
                    .page_manager
                    .lock()
                    .write_page(victim, &data[..])
                {
                    drop(data);
                    self.inner.page_table.insert(victim, frame_id);
                    state.replacer.unpin(frame_id);
                    return Err(e);
                }
                frame.is_dirty.store(false, Ordering::SeqCst);
                self.inner.counters.write_backs.fetch_add(1, Ordering::Relaxed);
            }

            state.resident[frame_id as usize] = None;
            self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            log::trace!("evicted page {} from frame {}", victim, frame_id);
            return Ok(Some(frame_id));
        }

        Ok(None)
    }
}

/// One pin on a frame, released on drop.
struct FramePin {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
}

impl FramePin {
    fn new(inner: Arc<BufferPoolInner>, frame_id: FrameId) -> Self {
        Self { inner, frame_id }
    }
}

impl Drop for FramePin {
    fn drop(&mut self) {
        let frame = &self.inner.frames[self.frame_id as usize];
        let mut state = self.inner.state.lock();
        if frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            state.replacer.unpin(self.frame_id);
            drop(state);
            self.inner.frame_available.notify_one();
        }
    }
}

// Fields drop in declaration order: the data lock is released before the pin.
pub struct PageReadGuard {
    data: ArcRwLockReadGuard<RawRwLock, PageData>,
    _pin: FramePin,
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

pub struct PageWriteGuard {
    data: ArcRwLockWriteGuard<RawRwLock, PageData>,
    page_id: PageId,
    pin: FramePin,
}

impl PageWriteGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        // Marked while the write lock is still held so a concurrent flush
        // cannot clear it before seeing our bytes
        self.pin.inner.frames[self.pin.frame_id as usize]
            .is_dirty
            .store(true, Ordering::SeqCst);
    }
}
