use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::buffer::lru_k_replacer::LruKReplacer;
use crate::common::config::{FrameId, PageId, INVALID_PAGE_ID};
use crate::container::extendible_hash_table::ExtendibleHashTable;
use crate::storage::disk::disk_manager::DiskManager;
use crate::storage::page::page::PageData;

/// A frame slot: metadata guarded by the pool latch, content behind its own
/// reader-writer latch so page latching is orthogonal to pool operations.
struct Frame {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
    data: Arc<RwLock<PageData>>,
}

impl Frame {
    fn new() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
            data: Arc::new(RwLock::new(PageData::new())),
        }
    }
}

struct PoolInner {
    frames: Vec<Frame>,
    /// Resident-page map: page id -> frame id for exactly the cached pages.
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LruKReplacer,
    free_list: VecDeque<FrameId>,
}

/// Shared reference to a pinned page's content. The holder owes the buffer
/// pool one `unpin_page` (or wraps the handle in a [`PageGuard`]).
pub struct PageHandle {
    page_id: PageId,
    data: Arc<RwLock<PageData>>,
}

impl PageHandle {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &Arc<RwLock<PageData>> {
        &self.data
    }
}

/// Fixed pool of in-memory frames caching pages of the backing store.
///
/// One coarse mutex (the pool latch) guards the free list, the resident
/// map, the replacer, and all frame metadata for the duration of each
/// operation. Page contents are latched separately per frame.
pub struct BufferPoolManager {
    pool_size: usize,
    disk_manager: Arc<dyn DiskManager>,
    inner: Mutex<PoolInner>,
}

/// Bucket capacity of the resident-page map.
const PAGE_TABLE_BUCKET_SIZE: usize = 8;

impl BufferPoolManager {
    /// Creates a buffer pool with `pool_size` frames and an LRU-K replacer
    /// with lookback window `replacer_k`.
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: Arc<dyn DiskManager>) -> Self {
        let frames = (0..pool_size).map(|_| Frame::new()).collect();
        let free_list = (0..pool_size).collect();
        Self {
            pool_size,
            disk_manager,
            inner: Mutex::new(PoolInner {
                frames,
                page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
                replacer: LruKReplacer::new(pool_size, replacer_k),
                free_list,
            }),
        }
    }

    pub fn get_pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<dyn DiskManager> {
        &self.disk_manager
    }

    /// Picks a replacement frame from the free list, falling back to the
    /// replacer. Flushes and unmaps any page the chosen frame still holds.
    /// Returns `None` when every frame is pinned.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Option<FrameId> {
        let frame_id = match inner.free_list.pop_front() {
            Some(frame_id) => frame_id,
            None => inner.replacer.evict()?,
        };

        let frame = &mut inner.frames[frame_id];
        if frame.page_id != INVALID_PAGE_ID {
            debug_assert_eq!(frame.pin_count, 0, "evicted a pinned frame");
            if frame.is_dirty {
                let data = frame.data.read();
                self.disk_manager
                    .write_page(frame.page_id, data.as_array())
                    .expect("disk write failed while evicting");
            }
            let old_page_id = frame.page_id;
            inner.page_table.remove(&old_page_id);
            trace!("evicted page {} from frame {}", old_page_id, frame_id);
        }
        Some(frame_id)
    }

    /// Binds `page_id` to `frame_id` with pin count 1 and fresh metadata.
    fn install_page(inner: &mut PoolInner, frame_id: FrameId, page_id: PageId) {
        inner.replacer.record_access(frame_id);
        inner.replacer.set_evictable(frame_id, false);
        let frame = &mut inner.frames[frame_id];
        frame.page_id = page_id;
        frame.pin_count = 1;
        frame.is_dirty = false;
        inner.page_table.insert(page_id, frame_id);
    }

    /// Allocates a fresh page id and binds it to a frame, pinned. Returns
    /// `None` when all frames are in use and not evictable.
    pub fn new_page(&self) -> Option<(PageId, PageHandle)> {
        let mut inner = self.inner.lock();
        let frame_id = self.acquire_frame(&mut inner)?;
        let page_id = self.disk_manager.allocate_page();
        Self::install_page(&mut inner, frame_id, page_id);

        let frame = &inner.frames[frame_id];
        frame.data.write().reset_memory();
        debug!("new page {} in frame {}", page_id, frame_id);
        Some((
            page_id,
            PageHandle {
                page_id,
                data: frame.data.clone(),
            },
        ))
    }

    /// Returns the frame caching `page_id`, reading it from the store on a
    /// miss. Pins the page (+1). Returns `None` when the page is not
    /// resident and no frame can be freed.
    pub fn fetch_page(&self, page_id: PageId) -> Option<PageHandle> {
        let mut inner = self.inner.lock();

        if let Some(frame_id) = inner.page_table.find(&page_id) {
            inner.replacer.record_access(frame_id);
            inner.replacer.set_evictable(frame_id, false);
            let frame = &mut inner.frames[frame_id];
            frame.pin_count += 1;
            return Some(PageHandle {
                page_id,
                data: frame.data.clone(),
            });
        }

        let frame_id = self.acquire_frame(&mut inner)?;
        Self::install_page(&mut inner, frame_id, page_id);

        let frame = &inner.frames[frame_id];
        {
            let mut data = frame.data.write();
            self.disk_manager
                .read_page(page_id, data.as_array_mut())
                .expect("disk read failed while fetching");
        }
        Some(PageHandle {
            page_id,
            data: frame.data.clone(),
        })
    }

    /// Drops one pin on `page_id`, merging `is_dirty` into the frame's
    /// sticky dirty flag. When the pin count reaches zero the frame becomes
    /// evictable. Returns false if the page is not resident or already
    /// unpinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(frame_id) = inner.page_table.find(&page_id) else {
            return false;
        };
        let frame = &mut inner.frames[frame_id];
        if frame.pin_count == 0 {
            return false;
        }
        frame.pin_count -= 1;
        frame.is_dirty |= is_dirty;
        if frame.pin_count == 0 {
            inner.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Writes the frame caching `page_id` back to the store, clearing the
    /// dirty flag. Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> bool {
        let mut inner = self.inner.lock();
        let Some(frame_id) = inner.page_table.find(&page_id) else {
            return false;
        };
        let frame = &mut inner.frames[frame_id];
        {
            let data = frame.data.read();
            self.disk_manager
                .write_page(page_id, data.as_array())
                .expect("disk write failed while flushing");
        }
        frame.is_dirty = false;
        true
    }

    /// Flushes every resident page with a valid id.
    pub fn flush_all_pages(&self) {
        let mut inner = self.inner.lock();
        for frame in inner.frames.iter_mut() {
            if frame.page_id != INVALID_PAGE_ID {
                let data = frame.data.read();
                self.disk_manager
                    .write_page(frame.page_id, data.as_array())
                    .expect("disk write failed while flushing");
                drop(data);
                frame.is_dirty = false;
            }
        }
    }

    /// Removes `page_id` from the pool and frees it in the store. Returns
    /// false if the page is pinned; deleting a non-resident page succeeds.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut inner = self.inner.lock();
        if let Some(frame_id) = inner.page_table.find(&page_id) {
            if inner.frames[frame_id].pin_count > 0 {
                return false;
            }
            inner.page_table.remove(&page_id);
            inner.replacer.remove(frame_id);
            let frame = &mut inner.frames[frame_id];
            frame.page_id = INVALID_PAGE_ID;
            frame.is_dirty = false;
            frame.data.write().reset_memory();
            inner.free_list.push_back(frame_id);
        }
        self.disk_manager.deallocate_page(page_id);
        debug!("deleted page {}", page_id);
        true
    }

    /// Fetches `page_id` behind an RAII guard that unpins on drop.
    pub fn fetch_page_guarded(self: &Arc<Self>, page_id: PageId) -> Option<PageGuard> {
        let handle = self.fetch_page(page_id)?;
        Some(PageGuard::new(Arc::clone(self), handle))
    }

    /// Allocates a page behind an RAII guard that unpins on drop.
    pub fn new_page_guarded(self: &Arc<Self>) -> Option<(PageId, PageGuard)> {
        let (page_id, handle) = self.new_page()?;
        Some((page_id, PageGuard::new(Arc::clone(self), handle)))
    }

    /// Pin count of a resident page, `None` when not resident. Intended
    /// for assertions and diagnostics.
    pub fn pin_count_of(&self, page_id: PageId) -> Option<u32> {
        let inner = self.inner.lock();
        let frame_id = inner.page_table.find(&page_id)?;
        Some(inner.frames[frame_id].pin_count)
    }
}

/// RAII pin on a page. Records a sticky dirty intent and unpins the page
/// when dropped. Page latches are taken through the guard as owned guards
/// so they can be carried across scopes during latch crabbing; the latch
/// must be released before the guard is dropped.
pub struct PageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    data: Arc<RwLock<PageData>>,
    dirty: AtomicBool,
}

impl PageGuard {
    pub fn new(bpm: Arc<BufferPoolManager>, handle: PageHandle) -> Self {
        Self {
            bpm,
            page_id: handle.page_id,
            data: handle.data,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Acquires the page's read latch as an owned guard.
    pub fn read(&self) -> ArcRwLockReadGuard<RawRwLock, PageData> {
        RwLock::read_arc(&self.data)
    }

    /// Acquires the page's write latch as an owned guard.
    pub fn write(&self) -> ArcRwLockWriteGuard<RawRwLock, PageData> {
        RwLock::write_arc(&self.data)
    }

    /// Marks the page dirty for the eventual unpin.
    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Clears any recorded dirty intent (used before deleting the page).
    pub fn discard(&self) {
        self.dirty.store(false, Ordering::Relaxed);
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.bpm
            .unpin_page(self.page_id, self.dirty.load(Ordering::Relaxed));
    }
}
