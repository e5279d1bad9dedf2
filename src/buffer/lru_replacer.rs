use std::collections::{BTreeMap, HashMap};

use crate::common::FrameId;

/// Eviction policy over the frames of a buffer pool.
///
/// A replacer only tracks frames that are resident and unpinned. The buffer
/// pool serializes all calls under its own latch, so implementations need no
/// internal locking.
pub trait Replacer: Send {
    /// Removes and returns the next frame to evict, if any.
    fn victim(&mut self) -> Option<FrameId>;

    /// Marks a frame as in use, removing it from the candidates.
    fn pin(&mut self, frame_id: FrameId);

    /// Marks a frame as evictable.
    fn unpin(&mut self, frame_id: FrameId);

    /// Number of evictable frames.
    fn size(&self) -> usize;
}

/// Least-recently-unpinned replacement.
///
/// Each unpin stamps the frame with a monotonically increasing counter. The
/// victim is the frame with the smallest stamp. Unpinning a frame that is
/// already a candidate keeps its original position.
pub struct LruReplacer {
    /// Maximum number of frames the replacer can track
    capacity: usize,
    /// Next stamp to hand out
    next_stamp: u64,
    /// Candidate frames and their stamps
    stamps: HashMap<FrameId, u64>,
    /// Candidates ordered by stamp (oldest first)
    order: BTreeMap<u64, FrameId>,
}

impl LruReplacer {
    /// Creates a replacer for a pool of `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_stamp: 0,
            stamps: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Replacer for LruReplacer {
    fn victim(&mut self) -> Option<FrameId> {
        let (_, frame_id) = self.order.pop_first()?;
        self.stamps.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if let Some(stamp) = self.stamps.remove(&frame_id) {
            self.order.remove(&stamp);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if frame_id.as_usize() >= self.capacity
            || self.stamps.contains_key(&frame_id)
            || self.stamps.len() >= self.capacity
        {
            return;
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.stamps.insert(frame_id, stamp);
        self.order.insert(stamp, frame_id);
    }

    fn size(&self) -> usize {
        self.stamps.len()
    }
}
