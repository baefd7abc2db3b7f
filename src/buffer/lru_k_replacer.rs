use std::collections::{BTreeSet, VecDeque};

use log::trace;
use parking_lot::Mutex;

use crate::common::config::FrameId;

/// Per-frame tracking state: a ring buffer of the last `k` access
/// timestamps, the total access count, and the evictability flag.
struct FrameStatus {
    history: VecDeque<u64>,
    access_count: u64,
    evictable: bool,
}

impl FrameStatus {
    fn new(k: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(k),
            access_count: 0,
            evictable: false,
        }
    }

    fn add_record(&mut self, timestamp: u64, k: usize) {
        if self.history.len() == k {
            self.history.pop_front();
        }
        self.history.push_back(timestamp);
        self.access_count += 1;
    }

    /// The k-th most recent access timestamp. Only meaningful once the
    /// frame has at least `k` recorded accesses.
    fn kth_timestamp(&self) -> u64 {
        *self.history.front().expect("frame has no access history")
    }

    fn reset(&mut self) {
        self.history.clear();
        self.access_count = 0;
        self.evictable = false;
    }
}

struct ReplacerInner {
    frames: Vec<FrameStatus>,
    /// Evictable frames with fewer than `k` accesses, least recently
    /// accessed at the front. These have infinite backward k-distance.
    young: VecDeque<FrameId>,
    /// Evictable frames with at least `k` accesses, ordered by the k-th
    /// most recent timestamp ascending (largest backward k-distance first).
    mature: BTreeSet<(u64, FrameId)>,
    current_timestamp: u64,
    curr_size: usize,
}

/// LRU-K replacer: chooses the eviction victim with the largest backward
/// k-distance. Frames with fewer than `k` accesses win over all mature
/// frames, oldest first.
pub struct LruKReplacer {
    inner: Mutex<ReplacerInner>,
    replacer_size: usize,
    k: usize,
}

impl LruKReplacer {
    /// Creates a replacer tracking `num_frames` frame slots with lookback
    /// window `k`.
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "k must be positive");
        let frames = (0..num_frames).map(|_| FrameStatus::new(k)).collect();
        Self {
            inner: Mutex::new(ReplacerInner {
                frames,
                young: VecDeque::new(),
                mature: BTreeSet::new(),
                current_timestamp: 0,
                curr_size: 0,
            }),
            replacer_size: num_frames,
            k,
        }
    }

    /// Evicts the frame with the largest backward k-distance, clearing its
    /// tracking state. Returns `None` when no frame is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if inner.curr_size == 0 {
            return None;
        }

        let victim = if let Some(frame_id) = inner.young.pop_front() {
            frame_id
        } else {
            let &(ts, frame_id) = inner.mature.iter().next()?;
            inner.mature.remove(&(ts, frame_id));
            frame_id
        };

        inner.frames[victim].reset();
        inner.curr_size -= 1;
        trace!("evicting frame {}", victim);
        Some(victim)
    }

    /// Records an access to `frame_id` at the next logical timestamp,
    /// rotating the frame between the young and mature populations as its
    /// access count crosses `k`. The frame keeps its list position only
    /// while it is not evictable.
    pub fn record_access(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        assert!(frame_id < self.replacer_size, "frame id out of range");

        let ts = inner.current_timestamp;
        inner.current_timestamp += 1;

        let count = inner.frames[frame_id].access_count;
        if !inner.frames[frame_id].evictable {
            inner.frames[frame_id].add_record(ts, self.k);
            return;
        }

        let k = self.k as u64;
        if count < k - 1 {
            // Stays young; move to the back of the young list.
            inner.frames[frame_id].add_record(ts, self.k);
            inner.young.retain(|&f| f != frame_id);
            inner.young.push_back(frame_id);
        } else if count == k - 1 {
            // Crosses into the mature population.
            inner.frames[frame_id].add_record(ts, self.k);
            inner.young.retain(|&f| f != frame_id);
            let kth = inner.frames[frame_id].kth_timestamp();
            inner.mature.insert((kth, frame_id));
        } else {
            // Already mature; reinsert under the new k-th timestamp.
            let old_kth = inner.frames[frame_id].kth_timestamp();
            inner.mature.remove(&(old_kth, frame_id));
            inner.frames[frame_id].add_record(ts, self.k);
            let new_kth = inner.frames[frame_id].kth_timestamp();
            inner.mature.insert((new_kth, frame_id));
        }
    }

    /// Toggles the evictability of `frame_id`, adjusting the size counter
    /// and list membership. Setting a frame that has never been accessed to
    /// evictable is a no-op.
    pub fn set_evictable(&self, frame_id: FrameId, set_evictable: bool) {
        let mut inner = self.inner.lock();
        assert!(frame_id < self.replacer_size, "frame id out of range");

        if inner.frames[frame_id].evictable == set_evictable {
            return;
        }

        if inner.frames[frame_id].evictable {
            // Evictable to pinned: leave the population lists.
            inner.frames[frame_id].evictable = false;
            inner.curr_size -= 1;
            if inner.frames[frame_id].access_count < self.k as u64 {
                inner.young.retain(|&f| f != frame_id);
            } else {
                let kth = inner.frames[frame_id].kth_timestamp();
                inner.mature.remove(&(kth, frame_id));
            }
            return;
        }

        if inner.frames[frame_id].access_count == 0 {
            return;
        }

        inner.frames[frame_id].evictable = true;
        inner.curr_size += 1;
        if inner.frames[frame_id].access_count < self.k as u64 {
            inner.young.push_back(frame_id);
        } else {
            let kth = inner.frames[frame_id].kth_timestamp();
            inner.mature.insert((kth, frame_id));
        }
    }

    /// Forcibly clears the tracking state of `frame_id`. Only valid on
    /// evictable frames; removing a pinned frame is a no-op.
    pub fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        assert!(frame_id < self.replacer_size, "frame id out of range");

        if !inner.frames[frame_id].evictable {
            return;
        }

        if inner.frames[frame_id].access_count < self.k as u64 {
            inner.young.retain(|&f| f != frame_id);
        } else {
            let kth = inner.frames[frame_id].kth_timestamp();
            inner.mature.remove(&(kth, frame_id));
        }
        inner.frames[frame_id].reset();
        inner.curr_size -= 1;
    }

    /// Number of evictable frames.
    pub fn size(&self) -> usize {
        self.inner.lock().curr_size
    }
}
