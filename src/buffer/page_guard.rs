use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::FrameHeader;

/// Invoked when a guard is dropped: (page_id, dirtied) -> unpin in the pool.
type ReleaseFn = Box<dyn FnOnce(PageId, bool) + Send + Sync>;

/// Shared plumbing between the two guard flavors: keeps the frame alive,
/// remembers whether the holder dirtied the page, and runs the release
/// callback exactly once.
struct GuardInner {
    page_id: PageId,
    /// Keeps the frame alive for as long as the transmuted lock guard lives
    _frame: Arc<FrameHeader>,
    release: Option<ReleaseFn>,
    dirtied: bool,
}

impl GuardInner {
    fn new(page_id: PageId, frame: Arc<FrameHeader>, release: ReleaseFn) -> Self {
        Self {
            page_id,
            _frame: frame,
            release: Some(release),
            dirtied: false,
        }
    }

    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.page_id, self.dirtied);
        }
    }
}

/// RAII pin handle with shared access to the page bytes.
///
/// Holding the guard holds both the pin and the page's read latch; dropping
/// it releases the latch first and then unpins through the buffer pool.
pub struct ReadPageGuard {
    inner: GuardInner,
    data: Option<RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard {
    /// # Safety
    /// The lock guard's lifetime is erased to 'static; the Arc in `inner`
    /// keeps the frame (and thus the lock) alive for at least as long.
    pub(crate) unsafe fn new(page_id: PageId, frame: Arc<FrameHeader>, release: ReleaseFn) -> Self {
        let data = frame.data.read();
        let data: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> = std::mem::transmute(data);
        Self {
            inner: GuardInner::new(page_id, frame, release),
            data: Some(data),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.inner.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data.as_ref().expect("guard not released")[..]
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Release the page latch before unpinning in the pool.
        self.data.take();
        self.inner.release();
    }
}

/// RAII pin handle with exclusive access to the page bytes.
///
/// Holding the guard holds the pin and the page's write latch. Mutable
/// access marks the page dirty; the flag is folded into the frame on drop
/// and is monotone, an earlier writer's dirt is never cleared.
pub struct WritePageGuard {
    inner: GuardInner,
    data: Option<RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl WritePageGuard {
    /// # Safety
    /// Same contract as [`ReadPageGuard::new`].
    pub(crate) unsafe fn new(page_id: PageId, frame: Arc<FrameHeader>, release: ReleaseFn) -> Self {
        let data = frame.data.write();
        let data: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> = std::mem::transmute(data);
        Self {
            inner: GuardInner::new(page_id, frame, release),
            data: Some(data),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.inner.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data.as_ref().expect("guard not released")[..]
    }

    /// Mutable view of the page bytes; marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.inner.dirtied = true;
        &mut self.data.as_mut().expect("guard not released")[..]
    }

    /// Marks the page dirty without touching the bytes.
    pub fn set_dirty(&mut self) {
        self.inner.dirtied = true;
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.data.take();
        self.inner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FrameId;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_read_guard_releases_on_drop() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(PageId::new(1));
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 42;
        frame.fill_from(&page);

        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();

        let guard = unsafe {
            ReadPageGuard::new(
                PageId::new(1),
                frame.clone(),
                Box::new(move |_, _| released_clone.store(true, Ordering::SeqCst)),
            )
        };

        assert_eq!(guard.page_id(), PageId::new(1));
        assert_eq!(guard.data()[0], 42);
        assert!(!released.load(Ordering::SeqCst));

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_guard_reports_dirty() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(PageId::new(1));

        let dirtied = Arc::new(AtomicBool::new(false));
        let dirtied_clone = dirtied.clone();

        let mut guard = unsafe {
            WritePageGuard::new(
                PageId::new(1),
                frame.clone(),
                Box::new(move |_, dirty| dirtied_clone.store(dirty, Ordering::SeqCst)),
            )
        };

        guard.data_mut()[7] = 9;
        drop(guard);

        assert!(dirtied.load(Ordering::SeqCst));
        let mut out = [0u8; PAGE_SIZE];
        frame.snapshot_into(&mut out);
        assert_eq!(out[7], 9);
    }

    #[test]
    fn test_write_guard_clean_when_untouched() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(PageId::new(1));

        let dirtied = Arc::new(AtomicBool::new(true));
        let dirtied_clone = dirtied.clone();

        let guard = unsafe {
            WritePageGuard::new(
                PageId::new(1),
                frame.clone(),
                Box::new(move |_, dirty| dirtied_clone.store(dirty, Ordering::SeqCst)),
            )
        };
        drop(guard);
        assert!(!dirtied.load(Ordering::SeqCst));
    }
}
