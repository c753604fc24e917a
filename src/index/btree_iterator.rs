use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{RecordId, Result, INVALID_PAGE_ID};

use super::btree_page::{IndexKey, LeafPage};

/// Forward iterator over `(key, rid)` pairs in key order.
///
/// Holds a read guard on the current leaf, so the page stays pinned and
/// read-latched while positioned on it. Advancing past the end of a leaf
/// latches the next leaf before the current one is released. The end
/// sentinel is the rightmost leaf at index == size (or no leaf at all for an
/// empty tree).
pub struct BPlusTreeIterator<K: IndexKey> {
    bpm: Arc<BufferPoolManager>,
    guard: Option<ReadPageGuard>,
    index: usize,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTreeIterator<K> {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, guard: ReadPageGuard, index: usize) -> Self {
        Self {
            bpm,
            guard: Some(guard),
            index,
            _marker: PhantomData,
        }
    }

    /// Like [`new`](Self::new), but steps over an exhausted position so a
    /// seek landing past the last key of a leaf starts on the next leaf.
    pub(crate) fn new_normalized(
        bpm: Arc<BufferPoolManager>,
        guard: ReadPageGuard,
        index: usize,
    ) -> Result<Self> {
        let mut iter = Self::new(bpm, guard, index);
        iter.skip_exhausted()?;
        Ok(iter)
    }

    pub(crate) fn exhausted(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            guard: None,
            index: 0,
            _marker: PhantomData,
        }
    }

    /// True when no entries remain.
    pub fn is_end(&self) -> bool {
        match &self.guard {
            None => true,
            Some(guard) => {
                let leaf = LeafPage::<K>::new(guard.data());
                self.index >= leaf.size() && leaf.next_page_id() == INVALID_PAGE_ID
            }
        }
    }

    /// The entry under the cursor, None at the end.
    pub fn entry(&self) -> Option<(K, RecordId)> {
        let guard = self.guard.as_ref()?;
        let leaf = LeafPage::<K>::new(guard.data());
        if self.index < leaf.size() {
            Some(leaf.entry_at(self.index))
        } else {
            None
        }
    }

    /// Moves the cursor one entry forward.
    pub fn advance(&mut self) -> Result<()> {
        if self.guard.is_none() {
            return Ok(());
        }
        self.index += 1;
        self.skip_exhausted()
    }

    /// Crosses leaf boundaries until the cursor rests on an entry or on the
    /// end sentinel of the rightmost leaf.
    fn skip_exhausted(&mut self) -> Result<()> {
        loop {
            let Some(guard) = &self.guard else {
                return Ok(());
            };
            let (size, next) = {
                let leaf = LeafPage::<K>::new(guard.data());
                (leaf.size(), leaf.next_page_id())
            };
            if self.index < size {
                return Ok(());
            }
            if next == INVALID_PAGE_ID {
                self.index = size;
                return Ok(());
            }
            // Latch the next leaf, then let the current guard go.
            let next_guard = self.bpm.fetch_page_read(next)?;
            self.guard = Some(next_guard);
            self.index = 0;
        }
    }
}

impl<K: IndexKey> Iterator for BPlusTreeIterator<K> {
    type Item = Result<(K, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entry()?;
        match self.advance() {
            Ok(()) => Some(Ok(entry)),
            Err(e) => Some(Err(e)),
        }
    }
}

impl<K: IndexKey> PartialEq for BPlusTreeIterator<K> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.guard, &other.guard) {
            (None, None) => true,
            (Some(a), Some(b)) => a.page_id() == b.page_id() && self.index == other.index,
            _ => self.is_end() && other.is_end(),
        }
    }
}
