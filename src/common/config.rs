use super::types::PageId;

/// Size of a page in bytes (4 KB)
pub const PAGE_SIZE: usize = 4096;

/// Invalid page ID constant (reads as -1 when interpreted as i32)
pub const INVALID_PAGE_ID: PageId = PageId(u32::MAX);

/// Default buffer pool size (number of frames)
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 10;

/// Logical page reserved for the catalog's metadata. Owned by the catalog, never
/// touched by this crate beyond keeping it allocated.
pub const CATALOG_META_PAGE_ID: PageId = PageId(0);

/// Logical page holding the `index_id -> root_page_id` directory.
pub const INDEX_ROOTS_PAGE_ID: PageId = PageId(1);

/// Magic number at the start of the disk file meta page ("STRA").
pub const DISK_META_MAGIC: u32 = 0x5354_5241;

/// Bytes of bookkeeping at the start of a bitmap page.
pub const BITMAP_HEADER_SIZE: usize = 8;

/// Number of data pages governed by one bitmap page (one extent).
pub const BITMAP_SIZE: u32 = ((PAGE_SIZE - BITMAP_HEADER_SIZE) * 8) as u32;
