pub mod btree;
pub mod btree_iterator;
pub mod btree_page;
pub mod transaction;

pub use btree::BPlusTree;
pub use btree_iterator::BPlusTreeIterator;
pub use btree_page::{IndexKey, LeafPage, LeafPageMut, InternalPage, InternalPageMut};
pub use transaction::Transaction;
