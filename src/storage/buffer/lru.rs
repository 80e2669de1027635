use super::replacer::{FrameId, Replacer};
use std::collections::{BTreeMap, HashMap};

/// Least-recently-used replacer.
///
/// Recency is the moment a frame became evictable, i.e. when its last pin
/// was released. Each unpin takes a fresh tick from a monotonic counter; the
/// smallest tick is evicted first.
#[derive(Debug)]
pub struct LruReplacer {
    /// tick -> frame, oldest first
    order: BTreeMap<u64, FrameId>,
    /// frame -> tick, for O(log n) removal
    ticks: HashMap<FrameId, u64>,
    next_tick: u64,
    /// Maximum number of frames
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            order: BTreeMap::new(),
            ticks: HashMap::with_capacity(max_size),
            next_tick: 0,
            max_size,
        }
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        let (_, frame_id) = self.order.pop_first()?;
        self.ticks.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if let Some(tick) = self.ticks.remove(&frame_id) {
            self.order.remove(&tick);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if self.ticks.contains_key(&frame_id) || self.ticks.len() >= self.max_size {
            return;
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.order.insert(tick, frame_id);
        self.ticks.insert(frame_id, tick);
    }

    fn size(&self) -> usize {
        self.ticks.len()
    }
}
