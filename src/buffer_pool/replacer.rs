use core::fmt::Debug;

use priority_queue::PriorityQueue;

use super::FrameId;

/// Tracks unpinned frames only: `insert` on last unpin, `erase` on repin,
/// `victim` hands back the least recently released frame.
pub(super) trait Replacer: Send + Sync + Debug {
    fn insert(&mut self, frame_id: FrameId);
    fn victim(&mut self) -> Option<FrameId>;
    fn erase(&mut self, frame_id: FrameId);
    fn len(&self) -> usize;
    #[cfg(test)]
    fn peek(&self) -> Option<FrameId>;
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug)]
pub(super) struct LRU {
    timestamp: i64,
    /// negated timestamps so the queue surfaces the oldest access first
    heap: PriorityQueue<FrameId, i64>,
}

impl LRU {
    pub fn new(size: usize) -> Self {
        Self {
            timestamp: 0,
            heap: PriorityQueue::with_capacity(size),
        }
    }
}

impl Replacer for LRU {
    /// Track the frame, moving it to most-recent if already present
    fn insert(&mut self, frame_id: FrameId) {
        self.timestamp += 1;
        self.heap.push_decrease(frame_id, -self.timestamp);
    }

    fn victim(&mut self) -> Option<FrameId> {
        self.heap.pop().map(|(frame_id, _)| frame_id)
    }

    fn erase(&mut self, frame_id: FrameId) {
        self.heap.remove(&frame_id);
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    fn peek(&self) -> Option<FrameId> {
        self.heap.peek().map(|(frame_id, _)| *frame_id)
    }
}
