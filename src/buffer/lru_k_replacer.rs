use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::FrameId;

/// Per-frame bookkeeping: how often the frame has been used and whether the
/// buffer pool currently allows evicting it.
#[derive(Debug, Default)]
struct FrameEntry {
    use_count: usize,
    evictable: bool,
}

/// Mutable replacer state, guarded as a whole by one latch.
///
/// Frames with fewer than k recorded accesses live in `history`; frames with
/// k or more live in `cache`. Both queues keep the most recently touched
/// frame at the front, so eviction scans run back-to-front.
struct ReplacerCore {
    history: VecDeque<FrameId>,
    cache: VecDeque<FrameId>,
    entries: HashMap<FrameId, FrameEntry>,
    curr_size: usize,
}

impl ReplacerCore {
    fn unlink(list: &mut VecDeque<FrameId>, frame_id: FrameId) {
        if let Some(pos) = list.iter().position(|&f| f == frame_id) {
            list.remove(pos);
        }
    }
}

/// LRU-K replacement policy.
///
/// Frames seen fewer than k times wait in a history queue and are evicted
/// FIFO by first access; once a frame reaches k accesses it is promoted to
/// the cache queue and evicted by true LRU among its peers. Victims are
/// taken from the history queue first, so pages without enough reuse history
/// go before established ones.
pub struct LruKReplacer {
    k: usize,
    replacer_size: usize,
    core: Mutex<ReplacerCore>,
}

impl LruKReplacer {
    /// Creates a replacer tracking up to `replacer_size` frames with the
    /// given k value.
    pub fn new(k: usize, replacer_size: usize) -> Self {
        Self {
            k,
            replacer_size,
            core: Mutex::new(ReplacerCore {
                history: VecDeque::new(),
                cache: VecDeque::new(),
                entries: HashMap::new(),
                curr_size: 0,
            }),
        }
    }

    /// Records an access to `frame_id`. Must be called each time the buffer
    /// pool pins or touches the frame.
    pub fn record_access(&self, frame_id: FrameId) {
        assert!(
            frame_id.as_usize() < self.replacer_size,
            "frame id {} out of replacer bounds {}",
            frame_id,
            self.replacer_size
        );

        let mut core = self.core.lock();
        let entry = core.entries.entry(frame_id).or_default();
        entry.use_count += 1;
        let count = entry.use_count;

        if count == self.k {
            // Promotion: the frame graduates from history to the cache.
            if count > 1 {
                ReplacerCore::unlink(&mut core.history, frame_id);
            }
            core.cache.push_front(frame_id);
        } else if count > self.k {
            ReplacerCore::unlink(&mut core.cache, frame_id);
            core.cache.push_front(frame_id);
        } else if count == 1 {
            core.history.push_front(frame_id);
        }
        // 1 < count < k: history order is by first access, nothing moves.
    }

    /// Marks `frame_id` evictable or not, adjusting the evictable count.
    /// Unknown frames are ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        assert!(
            frame_id.as_usize() < self.replacer_size,
            "frame id {} out of replacer bounds {}",
            frame_id,
            self.replacer_size
        );

        let mut core = self.core.lock();
        let Some(entry) = core.entries.get_mut(&frame_id) else {
            return;
        };
        if entry.evictable == evictable {
            return;
        }
        entry.evictable = evictable;
        if evictable {
            core.curr_size += 1;
        } else {
            core.curr_size -= 1;
        }
    }

    /// Selects and removes a victim frame: the oldest evictable entry in the
    /// history queue, falling back to the least recently used evictable
    /// entry in the cache queue. Returns None when nothing is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut core = self.core.lock();

        let mut victim = None;
        if let Some(pos) = core
            .history
            .iter()
            .rposition(|f| core.entries[f].evictable)
        {
            victim = core.history.remove(pos);
        } else if let Some(pos) = core.cache.iter().rposition(|f| core.entries[f].evictable) {
            victim = core.cache.remove(pos);
        }

        if let Some(frame_id) = victim {
            core.entries.remove(&frame_id);
            core.curr_size -= 1;
        }
        victim
    }

    /// Drops `frame_id` from the replacer entirely. The caller asserts the
    /// frame is evictable; unknown frames are ignored.
    pub fn remove(&self, frame_id: FrameId) {
        let mut core = self.core.lock();
        let Some(entry) = core.entries.get(&frame_id) else {
            return;
        };
        assert!(
            entry.evictable,
            "remove called on non-evictable frame {}",
            frame_id
        );

        if entry.use_count < self.k {
            ReplacerCore::unlink(&mut core.history, frame_id);
        } else {
            ReplacerCore::unlink(&mut core.cache, frame_id);
        }
        core.entries.remove(&frame_id);
        core.curr_size -= 1;
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.core.lock().curr_size
    }

    /// Returns the k value of this replacer.
    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_replacer_is_empty() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.k(), 2);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_history_evicts_fifo() {
        let replacer = LruKReplacer::new(2, 10);

        for i in 0..3 {
            replacer.record_access(FrameId::new(i));
            replacer.set_evictable(FrameId::new(i), true);
        }
        assert_eq!(replacer.size(), 3);

        // All three are still in history; oldest first access goes first.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_history_evicted_before_cache() {
        let replacer = LruKReplacer::new(2, 10);

        // Frame 0 reaches k accesses and is promoted; frame 1 stays in
        // history and must be the victim despite being touched later.
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_cache_evicts_lru() {
        let replacer = LruKReplacer::new(2, 10);

        for i in 0..3 {
            replacer.record_access(FrameId::new(i));
            replacer.record_access(FrameId::new(i));
        }
        // Touch frame 0 again: it becomes the most recent cache entry.
        replacer.record_access(FrameId::new(0));

        for i in 0..3 {
            replacer.set_evictable(FrameId::new(i), true);
        }

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_non_evictable_frames_are_skipped() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.set_evictable(FrameId::new(1), true);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_toggle_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId::new(0), false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_set_evictable_unknown_frame_ignored() {
        let replacer = LruKReplacer::new(2, 10);
        replacer.set_evictable(FrameId::new(5), true);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_remove() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        replacer.remove(FrameId::new(0));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), None);

        // Removing an untracked frame is a no-op.
        replacer.remove(FrameId::new(7));
    }

    #[test]
    fn test_k_equals_one_behaves_like_lru() {
        let replacer = LruKReplacer::new(1, 10);

        for i in 0..3 {
            replacer.record_access(FrameId::new(i));
            replacer.set_evictable(FrameId::new(i), true);
        }
        // Every access goes straight to the cache; re-touch frame 0.
        replacer.record_access(FrameId::new(0));

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }
}
