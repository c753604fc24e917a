use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{FrameId, PageId, Result, SkiffError, INVALID_PAGE_ID, PAGE_SIZE};
use crate::container::ExtendibleHashTable;
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// State shared with guard release callbacks.
///
/// `latch` is the pool latch: it serializes frame selection, page-table
/// mutation, and the synchronous disk I/O of the miss path. The page table
/// and replacer carry their own internal latches but are only driven from
/// inside this critical section (and from guard release, which takes the
/// pool latch first).
struct PoolState {
    frames: Vec<Arc<FrameHeader>>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LruKReplacer,
    /// Free list; doubles as the data behind the pool latch
    latch: Mutex<VecDeque<FrameId>>,
}

/// BufferPoolManager owns a fixed array of in-memory frames and moves pages
/// between them and disk. Page lookup goes through an extendible hash table,
/// eviction through the LRU-K replacer, persistence through the disk
/// scheduler.
///
/// Pages are handed out as RAII guards: creating one pins the page and takes
/// its latch, dropping it releases both. A page whose pin count reaches zero
/// becomes evictable; a dirty page is always written back before its frame
/// is reused.
pub struct BufferPoolManager {
    pool_size: usize,
    state: Arc<PoolState>,
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a pool of `pool_size` frames over the given disk manager,
    /// using LRU-K replacement with the given k and an extendible hash table
    /// with buckets of `bucket_size` as the page directory.
    pub fn new_with_bucket_size(
        pool_size: usize,
        replacer_k: usize,
        bucket_size: usize,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(PoolState {
            frames,
            page_table: ExtendibleHashTable::new(bucket_size),
            replacer: LruKReplacer::new(replacer_k, pool_size),
            latch: Mutex::new(free_list),
        });

        Self {
            pool_size,
            state,
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Creates a pool with the default page-directory bucket size.
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::new_with_bucket_size(
            pool_size,
            replacer_k,
            crate::common::DEFAULT_BUCKET_SIZE,
            disk_manager,
        )
    }

    /// Allocates a fresh page and returns it pinned behind a write guard.
    /// Fails with `BufferPoolFull` when every frame is pinned; no page id is
    /// consumed in that case.
    pub fn new_page(&self) -> Result<WritePageGuard> {
        let (page_id, frame_id) = {
            let mut free_list = self.state.latch.lock();
            let frame_id = self.pick_replacement_frame(&mut free_list)?;
            let page_id = self.disk_scheduler.disk_manager().allocate_page()?;

            let frame = &self.state.frames[frame_id.as_usize()];
            frame.reset();
            frame.set_page_id(page_id);
            frame.pin();

            self.state.page_table.insert(page_id, frame_id);
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);
            (page_id, frame_id)
        };

        Ok(self.make_write_guard(page_id, frame_id))
    }

    /// Fetches a page for shared access, reading it from disk on a miss.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        let frame_id = self.fetch_frame(page_id)?;
        Ok(self.make_read_guard(page_id, frame_id))
    }

    /// Fetches a page for exclusive access, reading it from disk on a miss.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        let frame_id = self.fetch_frame(page_id)?;
        Ok(self.make_write_guard(page_id, frame_id))
    }

    /// Writes a page through to disk regardless of its dirty state and
    /// clears the dirty flag. Returns false if the page is not resident.
    ///
    /// The pool latch is only held for the directory lookup; the write
    /// itself runs under the page's read latch so a thread holding a page
    /// guard can still reach the pool.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(SkiffError::InvalidPageId(page_id));
        }

        let frame = {
            let _free_list = self.state.latch.lock();
            match self.state.page_table.find(&page_id) {
                Some(frame_id) => Arc::clone(&self.state.frames[frame_id.as_usize()]),
                None => return Ok(false),
            }
        };

        let data = frame.data.read();
        if frame.page_id() != page_id {
            // The frame was recycled under us; the eviction already wrote
            // the page out.
            return Ok(true);
        }
        self.disk_scheduler.schedule_write_sync(page_id, &**data)?;
        frame.set_dirty(false);
        Ok(true)
    }

    /// Writes every dirty resident page through to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        for frame in &self.state.frames {
            let data = frame.data.read();
            let page_id = frame.page_id();
            if page_id == INVALID_PAGE_ID || !frame.is_dirty() {
                continue;
            }
            self.disk_scheduler.schedule_write_sync(page_id, &**data)?;
            frame.set_dirty(false);
        }
        Ok(())
    }

    /// Deletes a page from the pool and deallocates its id. Succeeds when
    /// the page is absent or resident with zero pins; a pinned page is an
    /// error.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut free_list = self.state.latch.lock();

        let Some(frame_id) = self.state.page_table.find(&page_id) else {
            self.disk_scheduler.disk_manager().deallocate_page(page_id);
            return Ok(true);
        };

        let frame = &self.state.frames[frame_id.as_usize()];
        if frame.pin_count() > 0 {
            return Err(SkiffError::PageStillPinned(page_id));
        }

        self.state.page_table.remove(&page_id);
        self.state.replacer.remove(frame_id);
        frame.reset();
        free_list.push_back(frame_id);

        self.disk_scheduler.disk_manager().deallocate_page(page_id);
        Ok(true)
    }

    /// Returns the pin count of a resident page, None when absent.
    pub fn pin_count_of(&self, page_id: PageId) -> Option<u32> {
        let _free_list = self.state.latch.lock();
        self.state
            .page_table
            .find(&page_id)
            .map(|frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn free_frame_count(&self) -> usize {
        self.state.latch.lock().len()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.disk_scheduler.disk_manager()
    }

    /// Resolves a page to a pinned frame. Hit: pin and record the access.
    /// Miss: pick a replacement frame, load the page from disk, install the
    /// mapping. The pool latch is released before the caller takes the page
    /// latch.
    fn fetch_frame(&self, page_id: PageId) -> Result<FrameId> {
        if page_id == INVALID_PAGE_ID {
            return Err(SkiffError::InvalidPageId(page_id));
        }

        let mut free_list = self.state.latch.lock();

        if let Some(frame_id) = self.state.page_table.find(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];
            frame.pin();
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.pick_replacement_frame(&mut free_list)?;
        let frame = &self.state.frames[frame_id.as_usize()];

        let mut buf = [0u8; PAGE_SIZE];
        self.disk_scheduler.schedule_read_sync(page_id, &mut buf)?;
        frame.fill_from(&buf);
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.pin();

        self.state.page_table.insert(page_id, frame_id);
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);

        Ok(frame_id)
    }

    /// Picks a frame to host a page: the free list first, otherwise an
    /// eviction victim. A dirty victim is written through before its frame
    /// is reused and its page-table entry dropped.
    fn pick_replacement_frame(&self, free_list: &mut VecDeque<FrameId>) -> Result<FrameId> {
        if let Some(frame_id) = free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self
            .state
            .replacer
            .evict()
            .ok_or(SkiffError::BufferPoolFull)?;
        let frame = &self.state.frames[frame_id.as_usize()];
        let evicted_page_id = frame.page_id();

        if frame.is_dirty() {
            let mut buf = [0u8; PAGE_SIZE];
            frame.snapshot_into(&mut buf);
            self.disk_scheduler
                .schedule_write_sync(evicted_page_id, &buf)?;
        }

        self.state.page_table.remove(&evicted_page_id);
        frame.reset();
        Ok(frame_id)
    }

    fn make_read_guard(&self, page_id: PageId, frame_id: FrameId) -> ReadPageGuard {
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let state = Arc::clone(&self.state);
        unsafe { ReadPageGuard::new(page_id, frame, Box::new(move |p, d| Self::release(&state, p, d))) }
    }

    fn make_write_guard(&self, page_id: PageId, frame_id: FrameId) -> WritePageGuard {
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let state = Arc::clone(&self.state);
        unsafe {
            WritePageGuard::new(page_id, frame, Box::new(move |p, d| Self::release(&state, p, d)))
        }
    }

    /// Guard release path: fold the dirty flag in (monotone), unpin, and
    /// mark the frame evictable when the pin count reaches zero.
    fn release(state: &PoolState, page_id: PageId, dirtied: bool) {
        let _free_list = state.latch.lock();
        let Some(frame_id) = state.page_table.find(&page_id) else {
            return;
        };
        let frame = &state.frames[frame_id.as_usize()];
        if dirtied {
            frame.set_dirty(true);
        }
        if let Some(0) = frame.unpin() {
            state.replacer.set_evictable(frame_id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        (BufferPoolManager::new(pool_size, 2, dm), temp_file)
    }

    #[test]
    fn test_new_pool_is_all_free() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_new_page_is_pinned() {
        let (bpm, _temp) = create_bpm(10);

        let guard = bpm.new_page().unwrap();
        assert_eq!(guard.page_id(), PageId::new(0));
        assert_eq!(bpm.pin_count_of(guard.page_id()), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);

        let page_id = guard.page_id();
        drop(guard);
        assert_eq!(bpm.pin_count_of(page_id), Some(0));
    }

    #[test]
    fn test_write_then_read() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 42;
            guard.data_mut()[100] = 255;
            guard.page_id()
        };

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
        assert_eq!(guard.data()[100], 255);
    }

    #[test]
    fn test_all_frames_pinned_fails() {
        let (bpm, _temp) = create_bpm(2);

        let _g0 = bpm.new_page().unwrap();
        let _g1 = bpm.new_page().unwrap();

        assert!(matches!(bpm.new_page(), Err(SkiffError::BufferPoolFull)));
    }

    #[test]
    fn test_unpin_allows_reuse() {
        let (bpm, _temp) = create_bpm(3);

        let g0 = bpm.new_page().unwrap();
        let g1 = bpm.new_page().unwrap();
        let g2 = bpm.new_page().unwrap();
        assert_eq!(g0.page_id(), PageId::new(0));
        assert_eq!(g1.page_id(), PageId::new(1));
        assert_eq!(g2.page_id(), PageId::new(2));

        assert!(matches!(bpm.new_page(), Err(SkiffError::BufferPoolFull)));

        drop(g1);
        let g3 = bpm.new_page().unwrap();
        assert_eq!(g3.page_id(), PageId::new(3));
    }

    #[test]
    fn test_dirty_eviction_round_trip() {
        let (bpm, _temp) = create_bpm(1);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[..5].copy_from_slice(b"HELLO");
            guard.page_id()
        };

        // Forces the dirty page out of the single frame.
        let other = bpm.new_page().unwrap();
        assert_ne!(other.page_id(), page_id);
        drop(other);

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(&guard.data()[..5], b"HELLO");
    }

    #[test]
    fn test_fetch_invalid_page_id() {
        let (bpm, _temp) = create_bpm(1);
        assert!(matches!(
            bpm.fetch_page_read(INVALID_PAGE_ID),
            Err(SkiffError::InvalidPageId(_))
        ));
    }

    #[test]
    fn test_flush_and_cold_restart() {
        let temp_file = NamedTempFile::new().unwrap();
        let page_id = {
            let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
            let bpm = BufferPoolManager::new(10, 2, dm);
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 42;
            let page_id = guard.page_id();
            drop(guard);
            bpm.flush_page(page_id).unwrap();
            page_id
        };

        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = BufferPoolManager::new(10, 2, dm);
        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn test_delete_page() {
        let (bpm, _temp) = create_bpm(10);

        let guard = bpm.new_page().unwrap();
        let page_id = guard.page_id();

        assert!(matches!(
            bpm.delete_page(page_id),
            Err(SkiffError::PageStillPinned(_))
        ));

        drop(guard);
        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.pin_count_of(page_id), None);
        assert_eq!(bpm.free_frame_count(), 10);

        // Deleting an absent page succeeds.
        assert!(bpm.delete_page(PageId::new(99)).unwrap());
    }

    #[test]
    fn test_pin_count_tracks_guards() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = {
            let g = bpm.new_page().unwrap();
            g.page_id()
        };

        let r1 = bpm.fetch_page_read(page_id).unwrap();
        let r2 = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(bpm.pin_count_of(page_id), Some(2));

        drop(r1);
        assert_eq!(bpm.pin_count_of(page_id), Some(1));
        drop(r2);
        assert_eq!(bpm.pin_count_of(page_id), Some(0));
    }
}
