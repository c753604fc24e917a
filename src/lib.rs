//! Skiff - the storage-engine core of an educational relational database
//!
//! The crate implements the components that govern page lifetime, eviction,
//! on-disk durability, and concurrent index access:
//!
//! - **Buffer Pool** (`buffer`): a fixed array of in-memory frames with a
//!   pin/unpin protocol surfaced as RAII page guards
//!   - `BufferPoolManager`: fetches pages from disk and caches them
//!   - `LruKReplacer`: LRU-K eviction over frame access history
//!   - `FrameHeader`: per-frame metadata plus the page memory
//!   - `ReadPageGuard`/`WritePageGuard`: pin handles carrying the page latch
//!
//! - **Containers** (`container`): in-memory index structures
//!   - `ExtendibleHashTable`: the buffer pool's page-to-frame directory
//!
//! - **Storage** (`storage`): page-granular persistence
//!   - `DiskManager`: reads and writes fixed-size pages of the database file
//!   - `DiskScheduler`: background worker funneling page I/O
//!   - `HeaderPage`: the index-name to root-page-id record table on page 0
//!
//! - **Index** (`index`): a concurrent, durable B+Tree
//!   - `BPlusTree`: insert/remove/search with latch crabbing
//!   - `BPlusTreeIterator`: forward iteration over the leaf chain
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use skiff::buffer::BufferPoolManager;
//! use skiff::common::{PageId, RecordId, SlotId};
//! use skiff::index::BPlusTree;
//! use skiff::storage::disk::DiskManager;
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, disk_manager));
//!
//! let tree: BPlusTree<u32> = BPlusTree::new("orders_pk", bpm.clone(), 32, 32).unwrap();
//! tree.insert(&42, RecordId::new(PageId::new(7), SlotId::new(0))).unwrap();
//! assert!(tree.get_value(&42).unwrap().is_some());
//!
//! bpm.flush_all_pages().unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod container;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{PageId, RecordId, Result, SkiffError, SlotId};
