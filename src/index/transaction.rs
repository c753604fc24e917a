use std::collections::VecDeque;

use parking_lot::RwLockWriteGuard;

use crate::buffer::WritePageGuard;
use crate::common::PageId;

/// Per-operation write context for the B+Tree: the root latch, the queue of
/// ancestor page guards retained while descending, and the set of pages the
/// operation has emptied and must free once every latch is gone.
///
/// Guards retained here keep their pages pinned and write-latched until
/// [`release_all`](Self::release_all) drops them, which happens as soon as a
/// safe child proves the structural change cannot propagate further up.
pub struct Transaction<'a> {
    root_latch: Option<RwLockWriteGuard<'a, PageId>>,
    retained: VecDeque<WritePageGuard>,
    deleted: Vec<PageId>,
}

impl<'a> Transaction<'a> {
    pub fn new(root_latch: RwLockWriteGuard<'a, PageId>) -> Self {
        Self {
            root_latch: Some(root_latch),
            retained: VecDeque::new(),
            deleted: Vec::new(),
        }
    }

    /// Root page id as seen under the held root latch.
    pub fn root_id(&self) -> PageId {
        self.root_latch
            .as_deref()
            .copied()
            .unwrap_or(crate::common::INVALID_PAGE_ID)
    }

    /// Publishes a new root id through the held root latch.
    pub fn set_root_id(&mut self, root: PageId) {
        debug_assert!(self.root_latch.is_some(), "root latch already released");
        if let Some(guard) = self.root_latch.as_mut() {
            **guard = root;
        }
    }

    /// Queues an ancestor guard while descending.
    pub fn retain(&mut self, guard: WritePageGuard) {
        self.retained.push_back(guard);
    }

    /// Takes back the most recently retained ancestor (the parent of the
    /// node currently being worked on).
    pub fn pop_retained(&mut self) -> Option<WritePageGuard> {
        self.retained.pop_back()
    }

    /// Releases the root latch and every retained ancestor, top-down.
    pub fn release_all(&mut self) {
        self.root_latch = None;
        while let Some(guard) = self.retained.pop_front() {
            drop(guard);
        }
    }

    /// Marks a page for deletion once all latches are released.
    pub fn add_deleted(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }

    pub fn take_deleted(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.deleted)
    }
}
