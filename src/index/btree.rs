use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{
    PageId, RecordId, Result, SkiffError, HEADER_PAGE_ID, INVALID_PAGE_ID,
};
use crate::storage::page::{HeaderPage, HeaderPageMut};

use super::btree_iterator::BPlusTreeIterator;
use super::btree_page::{
    min_size_for, BTreePage, BTreePageMut, IndexKey, InternalPage, InternalPageMut, LeafPage,
    LeafPageMut,
};
use super::transaction::Transaction;

/// Which structural change a write descent must guard against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Delete,
}

/// Where a read descent is headed.
#[derive(Clone, Copy)]
enum Seek<'k, K> {
    First,
    Last,
    Key(&'k K),
}

/// A durable, key-ordered B+Tree index over buffer-pool pages.
///
/// Nodes are pages fetched through the buffer pool; parent/child links are
/// page ids, never in-memory pointers. Leaves are chained through next
/// pointers for range iteration. Keys are unique: inserting a duplicate
/// fails without overwriting.
///
/// Concurrency follows latch crabbing. Reads latch the child before
/// releasing the parent; writes retain ancestor latches in a [`Transaction`]
/// until a safe child shows the split or merge cannot propagate further up,
/// then release them all. The root id itself sits behind a reader-writer
/// latch, and every root change is mirrored into the header page record for
/// this index's name.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    root_page_id: RwLock<PageId>,
    bpm: Arc<BufferPoolManager>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Creates an empty named index. On a fresh database file this claims
    /// page 0 for the header record table before any other allocation.
    pub fn new(
        name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2, "leaf_max_size must be at least 2");
        assert!(
            internal_max_size >= 3,
            "internal_max_size must be at least 3"
        );

        if bpm.disk_manager().num_pages() == 0 {
            let mut guard = bpm.new_page()?;
            if guard.page_id() != HEADER_PAGE_ID {
                return Err(SkiffError::IndexCorrupted(
                    "header page was not the first allocation".to_string(),
                ));
            }
            HeaderPageMut::new(guard.data_mut()).init();
        }

        Ok(Self {
            index_name: name.into(),
            root_page_id: RwLock::new(INVALID_PAGE_ID),
            bpm,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    /// Reopens a named index from the header page record.
    pub fn open(
        name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let name = name.into();
        if bpm.disk_manager().num_pages() == 0 {
            let mut guard = bpm.new_page()?;
            if guard.page_id() != HEADER_PAGE_ID {
                return Err(SkiffError::IndexCorrupted(
                    "header page was not the first allocation".to_string(),
                ));
            }
            HeaderPageMut::new(guard.data_mut()).init();
        }
        let root = {
            let guard = bpm.fetch_page_read(HEADER_PAGE_ID)?;
            HeaderPage::new(guard.data())
                .get_root_id(&name)
                .unwrap_or(INVALID_PAGE_ID)
        };

        Ok(Self {
            index_name: name,
            root_page_id: RwLock::new(root),
            bpm,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup.
    pub fn get_value(&self, key: &K) -> Result<Option<RecordId>> {
        let Some(guard) = self.find_leaf_read(Seek::Key(key))? else {
            return Ok(None);
        };
        Ok(LeafPage::<K>::new(guard.data()).lookup(key))
    }

    /// Inserts a unique key. Returns false (and changes nothing) when the
    /// key is already present.
    pub fn insert(&self, key: &K, rid: RecordId) -> Result<bool> {
        let mut txn = Transaction::new(self.root_page_id.write());

        if txn.root_id() == INVALID_PAGE_ID {
            self.start_new_tree(key, rid, &mut txn)?;
            txn.release_all();
            return Ok(true);
        }

        let mut leaf_guard = self.find_leaf_write(key, WriteMode::Insert, &mut txn)?;

        {
            let leaf = LeafPage::<K>::new(leaf_guard.data());
            let idx = leaf.lower_bound(key);
            if idx < leaf.size() && leaf.key_at(idx) == *key {
                txn.release_all();
                return Ok(false);
            }
        }

        let size_after = {
            let mut leaf = LeafPageMut::<K>::new(leaf_guard.data_mut());
            leaf.insert(key, rid);
            leaf.as_ref().size()
        };

        if size_after < self.leaf_max_size {
            txn.release_all();
            return Ok(true);
        }

        self.split_leaf(&mut leaf_guard, &mut txn)?;
        Ok(true)
    }

    /// Deletes a key; absent keys are a no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut txn = Transaction::new(self.root_page_id.write());

        if txn.root_id() == INVALID_PAGE_ID {
            txn.release_all();
            return Ok(());
        }

        let mut leaf_guard = self.find_leaf_write(key, WriteMode::Delete, &mut txn)?;

        if LeafPage::<K>::new(leaf_guard.data()).lookup(key).is_none() {
            txn.release_all();
            return Ok(());
        }
        LeafPageMut::<K>::new(leaf_guard.data_mut()).remove(key);

        let delete_leaf = self.coalesce_or_redistribute(&mut leaf_guard, &mut txn, None)?;
        if delete_leaf {
            txn.add_deleted(leaf_guard.page_id());
        }
        drop(leaf_guard);

        // Best effort: a reader that resolved a stale next pointer may still
        // hold a pin for a moment, in which case the page is simply leaked.
        for page_id in txn.take_deleted() {
            let _ = self.bpm.delete_page(page_id);
        }
        Ok(())
    }

    /// Iterator over the whole tree in key order.
    pub fn begin(&self) -> Result<BPlusTreeIterator<K>> {
        match self.find_leaf_read(Seek::First)? {
            None => Ok(BPlusTreeIterator::exhausted(Arc::clone(&self.bpm))),
            Some(guard) => Ok(BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, 0)),
        }
    }

    /// Iterator positioned at the first entry with key >= `key`.
    pub fn begin_at(&self, key: &K) -> Result<BPlusTreeIterator<K>> {
        match self.find_leaf_read(Seek::Key(key))? {
            None => Ok(BPlusTreeIterator::exhausted(Arc::clone(&self.bpm))),
            Some(guard) => {
                let index = LeafPage::<K>::new(guard.data()).lower_bound(key);
                BPlusTreeIterator::new_normalized(Arc::clone(&self.bpm), guard, index)
            }
        }
    }

    /// The end sentinel: the rightmost leaf at index == size.
    pub fn end(&self) -> Result<BPlusTreeIterator<K>> {
        match self.find_leaf_read(Seek::Last)? {
            None => Ok(BPlusTreeIterator::exhausted(Arc::clone(&self.bpm))),
            Some(guard) => {
                let size = LeafPage::<K>::new(guard.data()).size();
                Ok(BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, size))
            }
        }
    }

    /// Read descent: latch the child, then release the parent. The root
    /// latch is dropped as soon as the root page's latch is held.
    fn find_leaf_read(&self, target: Seek<'_, K>) -> Result<Option<ReadPageGuard>> {
        let root_latch = self.root_page_id.read();
        let root_id = *root_latch;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.bpm.fetch_page_read(root_id)?;
        drop(root_latch);

        loop {
            if BTreePage::new(guard.data()).is_leaf() {
                return Ok(Some(guard));
            }
            let child_id = {
                let node = InternalPage::<K>::new(guard.data());
                match target {
                    Seek::First => node.child_at(0),
                    Seek::Last => node.child_at(node.size() - 1),
                    Seek::Key(key) => node.lookup_child(key),
                }
            };
            guard = self.bpm.fetch_page_read(child_id)?;
        }
    }

    /// Write descent with crabbing: each level's guard is queued on the
    /// transaction, and the whole queue is released the moment a safe child
    /// bounds the structural change.
    fn find_leaf_write(
        &self,
        key: &K,
        mode: WriteMode,
        txn: &mut Transaction<'_>,
    ) -> Result<WritePageGuard> {
        let mut guard = self.bpm.fetch_page_write(txn.root_id())?;
        if Self::is_safe(guard.data(), mode, true) {
            txn.release_all();
        }

        loop {
            if BTreePage::new(guard.data()).is_leaf() {
                return Ok(guard);
            }
            let child_id = InternalPage::<K>::new(guard.data()).lookup_child(key);
            let child = self.bpm.fetch_page_write(child_id)?;
            txn.retain(guard);
            if Self::is_safe(child.data(), mode, false) {
                txn.release_all();
            }
            guard = child;
        }
    }

    /// A node is safe when the pending operation cannot propagate past it:
    /// for inserts it still has slack, for deletes it sits above min size.
    fn is_safe(data: &[u8], mode: WriteMode, is_root: bool) -> bool {
        let page = BTreePage::new(data);
        match mode {
            WriteMode::Insert => {
                if page.is_leaf() {
                    page.size() < page.max_size() - 1
                } else {
                    page.size() < page.max_size()
                }
            }
            WriteMode::Delete => {
                if is_root {
                    page.size() > 2
                } else {
                    page.size() > page.min_size()
                }
            }
        }
    }

    /// First insert into an empty tree: a single leaf becomes the root.
    fn start_new_tree(&self, key: &K, rid: RecordId, txn: &mut Transaction<'_>) -> Result<()> {
        let mut guard = self.bpm.new_page()?;
        let root_id = guard.page_id();

        let mut leaf = LeafPageMut::<K>::new(guard.data_mut());
        leaf.init(root_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert(key, rid);

        txn.set_root_id(root_id);
        self.update_root_record(root_id)
    }

    /// Splits a full leaf: the upper half moves to a fresh sibling, the
    /// linked list is spliced, and the sibling's first key goes up.
    fn split_leaf(&self, leaf_guard: &mut WritePageGuard, txn: &mut Transaction<'_>) -> Result<()> {
        let mut new_guard = self.bpm.new_page()?;
        let new_id = new_guard.page_id();

        let parent_id = BTreePage::new(leaf_guard.data()).parent_page_id();
        let old_next = LeafPage::<K>::new(leaf_guard.data()).next_page_id();

        let upper =
            LeafPageMut::<K>::new(leaf_guard.data_mut()).drain_from(min_size_for(self.leaf_max_size));
        let separator = upper[0].0;

        {
            let mut new_leaf = LeafPageMut::<K>::new(new_guard.data_mut());
            new_leaf.init(new_id, parent_id, self.leaf_max_size);
            new_leaf.append_entries(&upper);
            new_leaf.set_next_page_id(old_next);
        }
        LeafPageMut::<K>::new(leaf_guard.data_mut()).set_next_page_id(new_id);

        self.insert_into_parent(leaf_guard, &mut new_guard, separator, txn)
    }

    /// Publishes a freshly split `(left, right)` pair to their parent,
    /// splitting the parent in turn when it is already full.
    fn insert_into_parent(
        &self,
        left: &mut WritePageGuard,
        right: &mut WritePageGuard,
        key: K,
        txn: &mut Transaction<'_>,
    ) -> Result<()> {
        let left_id = left.page_id();
        let right_id = right.page_id();
        let parent_id = BTreePage::new(left.data()).parent_page_id();

        if parent_id == INVALID_PAGE_ID {
            // The split reached the old root: grow the tree by one level.
            let mut root_guard = self.bpm.new_page()?;
            let root_id = root_guard.page_id();
            {
                let mut root = InternalPageMut::<K>::new(root_guard.data_mut());
                root.init(root_id, INVALID_PAGE_ID, self.internal_max_size);
                root.init_new_root(left_id, &key, right_id);
            }
            BTreePageMut::new(left.data_mut()).set_parent_page_id(root_id);
            BTreePageMut::new(right.data_mut()).set_parent_page_id(root_id);

            txn.set_root_id(root_id);
            self.update_root_record(root_id)?;
            txn.release_all();
            return Ok(());
        }

        // The child was unsafe, so its parent latch is still queued.
        let mut parent_guard = txn.pop_retained().ok_or_else(|| {
            SkiffError::IndexCorrupted("ancestor latch missing during split".to_string())
        })?;

        if InternalPage::<K>::new(parent_guard.data()).size() < self.internal_max_size {
            InternalPageMut::<K>::new(parent_guard.data_mut())
                .insert_after_child(left_id, &key, right_id);
            txn.release_all();
            return Ok(());
        }

        // Full parent: build an oversized scratch image with the new entry,
        // write the lower half back and move the upper half to a sibling.
        let mut entries = InternalPage::<K>::new(parent_guard.data()).entries();
        let pos = entries
            .iter()
            .position(|&(_, child)| child == left_id)
            .ok_or_else(|| {
                SkiffError::IndexCorrupted("split child missing from parent".to_string())
            })?;
        entries.insert(pos + 1, (key, right_id));

        let split_at = min_size_for(self.internal_max_size);
        let (lower, upper) = entries.split_at(split_at);

        let mut new_internal_guard = self.bpm.new_page()?;
        let new_internal_id = new_internal_guard.page_id();
        let grandparent_id = BTreePage::new(parent_guard.data()).parent_page_id();
        {
            let mut node = InternalPageMut::<K>::new(new_internal_guard.data_mut());
            node.init(new_internal_id, grandparent_id, self.internal_max_size);
            node.replace_entries(upper);
        }
        InternalPageMut::<K>::new(parent_guard.data_mut()).replace_entries(lower);

        for &(_, child_id) in upper {
            self.set_parent_of(child_id, new_internal_id, &mut [&mut *left, &mut *right])?;
        }

        let push_key = upper[0].0;
        self.insert_into_parent(&mut parent_guard, &mut new_internal_guard, push_key, txn)
    }

    /// Brings an underflowing node back above min size, preferring to
    /// borrow from a rich sibling and merging otherwise. Returns whether
    /// the caller should delete `node`.
    ///
    /// `survivor` is the child of `node` whose write guard the level below
    /// still holds; merges that move `node`'s children must write its parent
    /// pointer through that guard instead of fetching it again.
    fn coalesce_or_redistribute(
        &self,
        node: &mut WritePageGuard,
        txn: &mut Transaction<'_>,
        survivor: Option<&mut WritePageGuard>,
    ) -> Result<bool> {
        let node_id = node.page_id();
        let (is_root, size, min) = {
            let page = BTreePage::new(node.data());
            (page.is_root(), page.size(), page.min_size())
        };

        if is_root {
            let shrank = self.adjust_root(node, txn, survivor)?;
            txn.release_all();
            return Ok(shrank);
        }
        if size >= min {
            txn.release_all();
            return Ok(false);
        }

        let mut parent_guard = txn.pop_retained().ok_or_else(|| {
            SkiffError::IndexCorrupted("ancestor latch missing during coalesce".to_string())
        })?;
        let node_idx = InternalPage::<K>::new(parent_guard.data())
            .index_of_child(node_id)
            .ok_or_else(|| {
                SkiffError::IndexCorrupted("underflowing child missing from parent".to_string())
            })?;

        if node_idx > 0 {
            // Prefer the left sibling; node is the right one of the pair.
            let sibling_id = InternalPage::<K>::new(parent_guard.data()).child_at(node_idx - 1);
            let mut sibling_guard = self.bpm.fetch_page_write(sibling_id)?;

            if BTreePage::new(sibling_guard.data()).size() > min {
                self.redistribute(&mut sibling_guard, node, &mut parent_guard, node_idx, true)?;
                txn.release_all();
                return Ok(false);
            }

            match survivor {
                Some(held) => self.merge(
                    &mut sibling_guard,
                    node,
                    &mut parent_guard,
                    node_idx,
                    &mut [held],
                )?,
                None => self.merge(&mut sibling_guard, node, &mut parent_guard, node_idx, &mut [])?,
            }
            drop(sibling_guard);
            // Node was emptied into its left sibling; nothing below parent
            // stays latched besides the deleted node itself.
            let delete_parent = self.coalesce_or_redistribute(&mut parent_guard, txn, None)?;
            if delete_parent {
                txn.add_deleted(parent_guard.page_id());
            }
            return Ok(true);
        }

        // Leftmost child: work with the right sibling; node is the left one.
        let sibling_id = InternalPage::<K>::new(parent_guard.data()).child_at(node_idx + 1);
        let mut sibling_guard = self.bpm.fetch_page_write(sibling_id)?;

        if BTreePage::new(sibling_guard.data()).size() > min {
            self.redistribute(&mut sibling_guard, node, &mut parent_guard, node_idx, false)?;
            txn.release_all();
            return Ok(false);
        }

        self.merge(node, &mut sibling_guard, &mut parent_guard, node_idx + 1, &mut [])?;
        txn.add_deleted(sibling_guard.page_id());
        drop(sibling_guard);
        // Node absorbed its right sibling and remains a latched child of
        // parent, so it rides along as the survivor one level up.
        let delete_parent = self.coalesce_or_redistribute(&mut parent_guard, txn, Some(node))?;
        if delete_parent {
            txn.add_deleted(parent_guard.page_id());
        }
        Ok(false)
    }

    /// Merges the right node of a sibling pair into the left and reclaims
    /// the parent slot of the right one. Internal merges thread the parent
    /// separator through the sentinel slot; leaf merges splice the chain.
    fn merge(
        &self,
        left: &mut WritePageGuard,
        right: &mut WritePageGuard,
        parent: &mut WritePageGuard,
        right_slot: usize,
        held: &mut [&mut WritePageGuard],
    ) -> Result<()> {
        if BTreePage::new(right.data()).is_leaf() {
            let next = LeafPage::<K>::new(right.data()).next_page_id();
            let entries = LeafPageMut::<K>::new(right.data_mut()).drain_from(0);
            let mut left_leaf = LeafPageMut::<K>::new(left.data_mut());
            left_leaf.append_entries(&entries);
            left_leaf.set_next_page_id(next);
        } else {
            let separator = InternalPage::<K>::new(parent.data()).key_at(right_slot);
            let mut entries = InternalPage::<K>::new(right.data()).entries();
            entries[0].0 = separator;

            let left_id = left.page_id();
            InternalPageMut::<K>::new(left.data_mut()).append_entries(&entries);
            for &(_, child_id) in &entries {
                self.set_parent_of(child_id, left_id, held)?;
            }
        }

        InternalPageMut::<K>::new(parent.data_mut()).remove_at(right_slot);
        Ok(())
    }

    /// Moves one entry across the boundary between `node` and its sibling
    /// and patches the parent separator. `from_prev` means the sibling sits
    /// to the left of `node`.
    fn redistribute(
        &self,
        sibling: &mut WritePageGuard,
        node: &mut WritePageGuard,
        parent: &mut WritePageGuard,
        node_idx: usize,
        from_prev: bool,
    ) -> Result<()> {
        if BTreePage::new(node.data()).is_leaf() {
            if from_prev {
                let entry = LeafPageMut::<K>::new(sibling.data_mut()).pop_back();
                LeafPageMut::<K>::new(node.data_mut()).push_front(entry);
                InternalPageMut::<K>::new(parent.data_mut()).set_key_at(node_idx, &entry.0);
            } else {
                let entry = LeafPageMut::<K>::new(sibling.data_mut()).pop_front();
                LeafPageMut::<K>::new(node.data_mut()).push_back(entry);
                let new_first = LeafPage::<K>::new(sibling.data()).key_at(0);
                InternalPageMut::<K>::new(parent.data_mut()).set_key_at(node_idx + 1, &new_first);
            }
            return Ok(());
        }

        let node_id = node.page_id();
        if from_prev {
            // The old separator drops down as node's new discriminating key;
            // the moved entry's key replaces it in the parent.
            let separator = InternalPage::<K>::new(parent.data()).key_at(node_idx);
            let (moved_key, moved_child) = InternalPageMut::<K>::new(sibling.data_mut()).pop_back();
            {
                let mut n = InternalPageMut::<K>::new(node.data_mut());
                n.set_key_at(0, &separator);
                n.push_front((moved_key, moved_child));
            }
            self.set_parent_of(moved_child, node_id, &mut [])?;
            InternalPageMut::<K>::new(parent.data_mut()).set_key_at(node_idx, &moved_key);
        } else {
            let separator = InternalPage::<K>::new(parent.data()).key_at(node_idx + 1);
            let (_, moved_child) = InternalPageMut::<K>::new(sibling.data_mut()).pop_front();
            InternalPageMut::<K>::new(node.data_mut()).push_back((separator, moved_child));
            self.set_parent_of(moved_child, node_id, &mut [])?;
            let new_separator = InternalPage::<K>::new(sibling.data()).key_at(0);
            InternalPageMut::<K>::new(parent.data_mut()).set_key_at(node_idx + 1, &new_separator);
        }
        Ok(())
    }

    /// Shrinks the tree when a delete empties the root: a one-child
    /// internal root promotes its child, an empty leaf root leaves the tree
    /// empty. Returns whether the old root page should be freed.
    fn adjust_root(
        &self,
        root: &mut WritePageGuard,
        txn: &mut Transaction<'_>,
        survivor: Option<&mut WritePageGuard>,
    ) -> Result<bool> {
        let (is_leaf, size) = {
            let page = BTreePage::new(root.data());
            (page.is_leaf(), page.size())
        };

        if !is_leaf && size == 1 {
            let child_id = InternalPage::<K>::new(root.data()).child_at(0);
            match survivor {
                Some(held) => self.set_parent_of(child_id, INVALID_PAGE_ID, &mut [held])?,
                None => self.set_parent_of(child_id, INVALID_PAGE_ID, &mut [])?,
            }

            txn.set_root_id(child_id);
            self.update_root_record(child_id)?;
            return Ok(true);
        }

        if is_leaf && size == 0 {
            txn.set_root_id(INVALID_PAGE_ID);
            self.update_root_record(INVALID_PAGE_ID)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Rewrites a child's parent pointer, going through an already-held
    /// guard when the child is latched by the running operation.
    fn set_parent_of(
        &self,
        child_id: PageId,
        parent_id: PageId,
        held: &mut [&mut WritePageGuard],
    ) -> Result<()> {
        for guard in held.iter_mut() {
            if guard.page_id() == child_id {
                BTreePageMut::new(guard.data_mut()).set_parent_page_id(parent_id);
                return Ok(());
            }
        }
        let mut guard = self.bpm.fetch_page_write(child_id)?;
        BTreePageMut::new(guard.data_mut()).set_parent_page_id(parent_id);
        Ok(())
    }

    /// Persists a root change into the header page record for this index.
    fn update_root_record(&self, root_id: PageId) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(HEADER_PAGE_ID)?;
        HeaderPageMut::new(guard.data_mut()).set_record(&self.index_name, root_id)
    }
}
