use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::common::{PageId, Result, StrataError, BITMAP_SIZE, PAGE_SIZE};
use crate::storage::page::{BitmapPage, DiskFileMeta, MAX_EXTENTS};

/// Physical page holding the file meta page.
const META_PHYSICAL_PAGE: u64 = 0;

/// Allocation state mirrored from disk: the meta page and one bitmap per extent.
struct AllocState {
    meta: DiskFileMeta,
    bitmaps: Vec<BitmapPage>,
}

/// DiskManager owns the database file and hands out logical page ids.
///
/// The file is split into extents, each a bitmap page followed by the
/// `BITMAP_SIZE` data pages it governs. Physical page 0 is the meta page:
///
/// ```text
/// | meta | bitmap 0 | data 0 .. BITMAP_SIZE | bitmap 1 | data ... |
/// ```
///
/// Logical page `p` lives at physical page `2 + p + p / BITMAP_SIZE`.
/// Allocation state is cached in memory and written through on every change.
pub struct DiskManager {
    /// The database file
    db_file: Mutex<File>,
    /// Path to the database file
    db_path: String,
    alloc: Mutex<AllocState>,
    /// Number of data page reads performed
    num_reads: AtomicU32,
    /// Number of data page writes performed
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens the database file at `db_path`, creating and formatting it if it
    /// is empty. An existing file must start with a valid meta page.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)?;

        let file_size = file.metadata()?.len();
        let alloc = if file_size == 0 {
            let meta = DiskFileMeta::new();
            let mut buf = [0u8; PAGE_SIZE];
            meta.encode(&mut buf);
            write_physical(&mut file, META_PHYSICAL_PAGE, &buf)?;
            debug!("formatted new database file {}", path_str);
            AllocState {
                meta,
                bitmaps: Vec::new(),
            }
        } else {
            load_alloc_state(&mut file)?
        };

        Ok(Self {
            db_file: Mutex::new(file),
            db_path: path_str,
            alloc: Mutex::new(alloc),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    /// Reads a logical page into `data`. Pages never written read as zeros.
    /// The buffer must be exactly PAGE_SIZE bytes.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");
        if !page_id.is_valid() {
            return Err(StrataError::InvalidPageId(page_id));
        }

        let mut file = self.db_file.lock();
        read_physical(&mut file, physical_page(page_id), data)?;
        self.num_reads.fetch_add(1, Ordering::Relaxed);
        trace!("read {}", page_id);
        Ok(())
    }

    /// Writes a logical page from `data`.
    /// The buffer must be exactly PAGE_SIZE bytes.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");
        if !page_id.is_valid() {
            return Err(StrataError::InvalidPageId(page_id));
        }

        let mut file = self.db_file.lock();
        write_physical(&mut file, physical_page(page_id), data)?;
        self.num_writes.fetch_add(1, Ordering::Relaxed);
        trace!("wrote {}", page_id);
        Ok(())
    }

    /// Allocates the lowest free logical page and returns its id.
    /// The page is zero-initialized on disk.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut alloc = self.alloc.lock();

        let (extent, fresh) = match alloc.bitmaps.iter().position(|b| !b.is_full()) {
            Some(extent) => (extent, false),
            None => {
                if alloc.bitmaps.len() >= MAX_EXTENTS {
                    return Err(StrataError::DiskFull);
                }
                (alloc.bitmaps.len(), true)
            }
        };

        // Changes are staged on copies and only committed once they are on disk
        let mut bitmap = if fresh {
            BitmapPage::new()
        } else {
            alloc.bitmaps[extent].clone()
        };
        let offset = bitmap.allocate_page().ok_or(StrataError::DiskFull)?;
        let logical = extent as u64 * BITMAP_SIZE as u64 + offset as u64;
        if logical >= u32::MAX as u64 {
            return Err(StrataError::DiskFull);
        }

        let mut meta = alloc.meta.clone();
        if fresh {
            meta.extent_used_page.push(0);
        }
        meta.extent_used_page[extent] += 1;
        meta.num_allocated_pages += 1;

        let page_id = PageId::new(logical as u32);
        let mut file = self.db_file.lock();
        let written = persist_extent(&mut file, extent, &bitmap, &meta)
            .and_then(|()| write_physical(&mut file, physical_page(page_id), &[0u8; PAGE_SIZE]));
        if let Err(e) = written {
            error!("allocation of {} failed: {}", page_id, e);
            restore_extent(&mut file, &alloc, extent);
            return Err(e);
        }

        if fresh {
            alloc.bitmaps.push(bitmap);
        } else {
            alloc.bitmaps[extent] = bitmap;
        }
        alloc.meta = meta;

        debug!("allocated {}", page_id);
        Ok(page_id)
    }

    /// Returns a page to the allocator. Releasing a page that is already free
    /// is logged and otherwise ignored.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        let mut alloc = self.alloc.lock();

        let (extent, offset) = split_logical(page_id);
        let mut bitmap = match alloc.bitmaps.get(extent) {
            Some(bitmap) if page_id.is_valid() => bitmap.clone(),
            _ => {
                warn!("deallocate of {} which is not allocated", page_id);
                return Ok(());
            }
        };
        if !bitmap.deallocate_page(offset) {
            warn!("deallocate of {} which is not allocated", page_id);
            return Ok(());
        }

        let mut meta = alloc.meta.clone();
        meta.extent_used_page[extent] -= 1;
        meta.num_allocated_pages -= 1;

        let mut file = self.db_file.lock();
        if let Err(e) = persist_extent(&mut file, extent, &bitmap, &meta) {
            error!("deallocation of {} failed: {}", page_id, e);
            restore_extent(&mut file, &alloc, extent);
            return Err(e);
        }

        alloc.bitmaps[extent] = bitmap;
        alloc.meta = meta;

        debug!("deallocated {}", page_id);
        Ok(())
    }

    /// Returns true if `page_id` is not currently allocated.
    pub fn is_page_free(&self, page_id: PageId) -> bool {
        if !page_id.is_valid() {
            return false;
        }
        let (extent, offset) = split_logical(page_id);
        let alloc = self.alloc.lock();
        match alloc.bitmaps.get(extent) {
            Some(bitmap) => bitmap.is_page_free(offset),
            None => true,
        }
    }

    /// Returns the number of pages currently allocated.
    pub fn get_num_pages(&self) -> u32 {
        self.alloc.lock().meta.num_allocated_pages
    }

    /// Returns the number of extents the file has grown to.
    pub fn get_num_extents(&self) -> u32 {
        self.alloc.lock().meta.num_extents()
    }

    /// Returns the number of data page reads performed.
    pub fn get_num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of data page writes performed.
    pub fn get_num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    /// Returns the path to the database file.
    pub fn get_db_path(&self) -> &str {
        &self.db_path
    }

    /// Flushes any buffered writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.db_file.lock();
        file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let file = self.db_file.get_mut();
        let _ = file.sync_all();
    }
}

fn split_logical(page_id: PageId) -> (usize, u32) {
    let p = page_id.as_u32();
    ((p / BITMAP_SIZE) as usize, p % BITMAP_SIZE)
}

fn physical_page(page_id: PageId) -> u64 {
    let p = page_id.as_u32() as u64;
    2 + p + p / BITMAP_SIZE as u64
}

fn bitmap_physical_page(extent: usize) -> u64 {
    1 + extent as u64 * (BITMAP_SIZE as u64 + 1)
}

fn load_alloc_state(file: &mut File) -> Result<AllocState> {
    let mut buf = [0u8; PAGE_SIZE];
    read_physical(file, META_PHYSICAL_PAGE, &mut buf)?;
    let meta = DiskFileMeta::decode(&buf)?;

    let mut bitmaps = Vec::with_capacity(meta.extent_used_page.len());
    for (extent, &used) in meta.extent_used_page.iter().enumerate() {
        read_physical(file, bitmap_physical_page(extent), &mut buf)?;
        let bitmap = BitmapPage::from_bytes(&buf);
        if bitmap.allocated_count() != used {
            return Err(StrataError::CorruptFormat(format!(
                "extent {} bitmap holds {} pages, meta says {}",
                extent,
                bitmap.allocated_count(),
                used
            )));
        }
        bitmaps.push(bitmap);
    }

    debug!(
        "loaded disk meta: {} pages in {} extents",
        meta.num_allocated_pages,
        meta.num_extents()
    );
    Ok(AllocState { meta, bitmaps })
}

fn persist_extent(
    file: &mut File,
    extent: usize,
    bitmap: &BitmapPage,
    meta: &DiskFileMeta,
) -> Result<()> {
    write_physical(file, bitmap_physical_page(extent), bitmap.as_bytes())?;
    let mut buf = [0u8; PAGE_SIZE];
    meta.encode(&mut buf);
    write_physical(file, META_PHYSICAL_PAGE, &buf)
}

/// Best-effort rewrite of the committed state of `extent` after a failed
/// update, so a partial write does not leave the bitmap and meta disagreeing.
fn restore_extent(file: &mut File, alloc: &AllocState, extent: usize) {
    let restored = match alloc.bitmaps.get(extent) {
        Some(bitmap) => persist_extent(file, extent, bitmap, &alloc.meta),
        None => {
            let mut buf = [0u8; PAGE_SIZE];
            alloc.meta.encode(&mut buf);
            write_physical(file, META_PHYSICAL_PAGE, &buf)
        }
    };
    if let Err(e) = restored {
        error!("failed to restore allocation state of extent {}: {}", extent, e);
    }
}

fn read_physical(file: &mut File, physical: u64, data: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(physical * PAGE_SIZE as u64))?;

    // Reading beyond the end of the file yields zeros
    let mut filled = 0;
    while filled < data.len() {
        let n = file.read(&mut data[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data[filled..].fill(0);
    Ok(())
}

fn write_physical(file: &mut File, physical: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(physical * PAGE_SIZE as u64))?;
    file.write_all(data)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_disk_manager_new() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();
        assert_eq!(dm.get_num_pages(), 0);
        assert_eq!(dm.get_num_extents(), 0);
    }

    #[test]
    fn test_disk_manager_allocate_page() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();

        let page_id = dm.allocate_page().unwrap();
        assert_eq!(page_id, PageId::new(0));
        assert_eq!(dm.get_num_pages(), 1);
        assert!(!dm.is_page_free(page_id));

        let page_id2 = dm.allocate_page().unwrap();
        assert_eq!(page_id2, PageId::new(1));
        assert_eq!(dm.get_num_pages(), 2);
        assert_eq!(dm.get_num_extents(), 1);
    }

    #[test]
    fn test_disk_manager_read_write() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();

        let page_id = dm.allocate_page().unwrap();

        let mut write_data = [0u8; PAGE_SIZE];
        write_data[0] = 42;
        write_data[100] = 255;
        write_data[PAGE_SIZE - 1] = 128;
        dm.write_page(page_id, &write_data).unwrap();

        let mut read_data = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_data).unwrap();

        assert_eq!(read_data[0], 42);
        assert_eq!(read_data[100], 255);
        assert_eq!(read_data[PAGE_SIZE - 1], 128);
        assert_eq!(dm.get_num_reads(), 1);
        assert_eq!(dm.get_num_writes(), 1);
    }

    #[test]
    fn test_disk_manager_physical_mapping() {
        assert_eq!(physical_page(PageId::new(0)), 2);
        assert_eq!(physical_page(PageId::new(BITMAP_SIZE - 1)), BITMAP_SIZE as u64 + 1);
        // First page of the second extent skips the second bitmap page
        assert_eq!(physical_page(PageId::new(BITMAP_SIZE)), BITMAP_SIZE as u64 + 3);
        assert_eq!(bitmap_physical_page(1), BITMAP_SIZE as u64 + 2);
    }

    #[test]
    fn test_disk_manager_invalid_page() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();

        let mut data = [0u8; PAGE_SIZE];
        assert!(matches!(
            dm.read_page(crate::common::INVALID_PAGE_ID, &mut data),
            Err(StrataError::InvalidPageId(_))
        ));
        assert!(!dm.is_page_free(crate::common::INVALID_PAGE_ID));
    }

    /// Swaps the database file for one whose writes fail with ENOSPC.
    #[cfg(target_os = "linux")]
    fn swap_in_full_device(dm: &DiskManager) -> File {
        let full = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/full")
            .unwrap();
        std::mem::replace(&mut *dm.db_file.lock(), full)
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_disk_manager_failed_allocate_keeps_state() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();

        let real = swap_in_full_device(&dm);
        assert!(matches!(dm.allocate_page(), Err(StrataError::Io(_))));
        assert_eq!(dm.get_num_pages(), 0);
        assert_eq!(dm.get_num_extents(), 0);
        assert!(dm.is_page_free(PageId::new(0)));

        *dm.db_file.lock() = real;
        assert_eq!(dm.allocate_page().unwrap(), PageId::new(0));
        assert_eq!(dm.get_num_pages(), 1);

        // Existing extent, second page
        let real = swap_in_full_device(&dm);
        assert!(matches!(dm.allocate_page(), Err(StrataError::Io(_))));
        assert_eq!(dm.get_num_pages(), 1);
        assert!(dm.is_page_free(PageId::new(1)));

        *dm.db_file.lock() = real;
        assert_eq!(dm.allocate_page().unwrap(), PageId::new(1));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_disk_manager_failed_deallocate_keeps_page() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();
        let page_id = {
            let dm = DiskManager::new(&path).unwrap();
            let page_id = dm.allocate_page().unwrap();

            let real = swap_in_full_device(&dm);
            assert!(matches!(dm.deallocate_page(page_id), Err(StrataError::Io(_))));
            assert!(!dm.is_page_free(page_id));
            assert_eq!(dm.get_num_pages(), 1);
            *dm.db_file.lock() = real;

            // The page was not handed out twice
            assert_eq!(dm.allocate_page().unwrap(), PageId::new(1));
            page_id
        };

        let dm = DiskManager::new(&path).unwrap();
        assert!(!dm.is_page_free(page_id));
        assert_eq!(dm.get_num_pages(), 2);
    }
}
