use std::fmt::Debug;

pub type FrameId = u32;

/// Eviction policy over buffer frames.
///
/// The buffer pool reports every pin-count transition: `pin` when a frame
/// becomes referenced, `unpin` when its last reference is released. Only
/// frames currently unpinned may be returned by `evict`.
pub trait Replacer: Send + Sync + Debug {
    /// Select a frame to evict. Returns None if no frame can be evicted.
    fn evict(&mut self) -> Option<FrameId>;

    /// Mark a frame as pinned (not evictable).
    fn pin(&mut self, frame_id: FrameId);

    /// Mark a frame as unpinned (evictable).
    fn unpin(&mut self, frame_id: FrameId);

    /// Get the number of evictable frames.
    fn size(&self) -> usize;
}
