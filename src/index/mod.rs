pub mod btree_page;
mod btree_index;
mod btree_internal_page;
mod btree_iterator;
mod btree_leaf_page;
mod key_comparator;

pub use btree_index::{BPlusTree, BPlusTreeOptions, Rebalance, TreeStats};
pub use btree_internal_page::InternalNode;
pub use btree_iterator::IndexIterator;
pub use btree_leaf_page::LeafNode;
pub use btree_page::{BTreeNode, BTreePageHeader, PageType};
pub use key_comparator::{BytewiseComparator, IntegerComparator, KeyComparator};
