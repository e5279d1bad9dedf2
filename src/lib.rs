//! Strata - the storage core of a disk-oriented database
//!
//! Pages live in a single database file and are cached in a fixed pool of
//! in-memory frames. A disk-resident B+Tree index is built on top of the
//! pool.
//!
//! # Architecture
//!
//! - **Storage** (`storage`): the database file and the page layouts that
//!   manage it
//!   - `DiskManager`: reads and writes logical pages, allocates them through
//!     per-extent bitmap pages
//!   - `BitmapPage`, `DiskFileMeta`: on-disk allocation state
//!   - `IndexRootsPage`: maps index ids to their root pages
//!
//! - **Buffer Pool** (`buffer`): caches pages in frames
//!   - `BufferPoolManager`: fetch, create, unpin, delete and flush pages
//!   - `LruReplacer`: least-recently-unpinned eviction
//!   - `ReadPageGuard`/`WritePageGuard`: pinned, latched page access
//!
//! - **Index** (`index`): B+Tree over fixed-width keys
//!   - `BPlusTree`: unique-key insert, remove and point lookup
//!   - `IndexIterator`: ordered scans along the leaf chain
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata::buffer::BufferPoolManager;
//! use strata::index::{BPlusTree, BPlusTreeOptions, IntegerComparator};
//! use strata::storage::disk::DiskManager;
//! use strata::{PageId, RowId};
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, disk_manager));
//!
//! let key_size = 4;
//! let tree = BPlusTree::new(
//!     0,
//!     Arc::clone(&bpm),
//!     Arc::new(IntegerComparator),
//!     key_size,
//!     BPlusTreeOptions::new(),
//! )
//! .unwrap();
//!
//! let key = IntegerComparator::key(42, key_size);
//! tree.insert(&key, RowId::new(PageId::new(7), 3)).unwrap();
//! assert!(tree.get_value(&key).unwrap().is_some());
//!
//! bpm.flush_all_pages().unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{IndexId, PageId, Result, RowId, StrataError};
