//! Integration tests for the disk manager

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;

use strata::common::{PageId, StrataError, INVALID_PAGE_ID, PAGE_SIZE};
use strata::storage::disk::DiskManager;
use tempfile::NamedTempFile;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_disk_manager_create_file() {
    init_logger();
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path()).unwrap();

    assert_eq!(dm.get_num_pages(), 0);
    assert_eq!(dm.get_num_extents(), 0);
    assert_eq!(dm.get_num_reads(), 0);
    assert_eq!(dm.get_num_writes(), 0);

    // Only the meta page is written up front
    let len = std::fs::metadata(temp_file.path()).unwrap().len();
    assert_eq!(len, PAGE_SIZE as u64);
}

#[test]
fn test_disk_manager_allocate_pages() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path()).unwrap();

    for i in 0..10 {
        let page_id = dm.allocate_page().unwrap();
        assert_eq!(page_id, PageId::new(i));
        assert!(!dm.is_page_free(page_id));
    }

    assert_eq!(dm.get_num_pages(), 10);
    assert_eq!(dm.get_num_extents(), 1);
    assert!(dm.is_page_free(PageId::new(10)));
}

#[test]
fn test_disk_manager_reuses_lowest_free_page() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path()).unwrap();

    for _ in 0..6 {
        dm.allocate_page().unwrap();
    }
    dm.deallocate_page(PageId::new(4)).unwrap();
    dm.deallocate_page(PageId::new(2)).unwrap();
    assert!(dm.is_page_free(PageId::new(2)));
    assert_eq!(dm.get_num_pages(), 4);

    assert_eq!(dm.allocate_page().unwrap(), PageId::new(2));
    assert_eq!(dm.allocate_page().unwrap(), PageId::new(4));
    assert_eq!(dm.allocate_page().unwrap(), PageId::new(6));
}

#[test]
fn test_disk_manager_double_deallocate_is_ignored() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path()).unwrap();

    let page_id = dm.allocate_page().unwrap();
    dm.deallocate_page(page_id).unwrap();
    dm.deallocate_page(page_id).unwrap();
    dm.deallocate_page(PageId::new(500)).unwrap();
    assert_eq!(dm.get_num_pages(), 0);
}

#[test]
fn test_disk_manager_read_write_page() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path()).unwrap();

    let page_id = dm.allocate_page().unwrap();

    let mut write_data = [0u8; PAGE_SIZE];
    for (i, byte) in write_data.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    dm.write_page(page_id, &write_data).unwrap();

    let mut read_data = [0u8; PAGE_SIZE];
    dm.read_page(page_id, &mut read_data).unwrap();
    assert_eq!(read_data, write_data);

    assert_eq!(dm.get_num_writes(), 1);
    assert_eq!(dm.get_num_reads(), 1);
}

#[test]
fn test_disk_manager_new_page_is_zeroed() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path()).unwrap();

    let page_id = dm.allocate_page().unwrap();
    dm.write_page(page_id, &[0xAB; PAGE_SIZE]).unwrap();
    dm.deallocate_page(page_id).unwrap();

    assert_eq!(dm.allocate_page().unwrap(), page_id);
    let mut data = [0xFFu8; PAGE_SIZE];
    dm.read_page(page_id, &mut data).unwrap();
    assert!(data.iter().all(|&b| b == 0));
}

#[test]
fn test_disk_manager_invalid_page() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path()).unwrap();

    let mut data = [0u8; PAGE_SIZE];
    assert!(matches!(
        dm.read_page(INVALID_PAGE_ID, &mut data),
        Err(StrataError::InvalidPageId(_))
    ));
    assert!(matches!(
        dm.write_page(INVALID_PAGE_ID, &data),
        Err(StrataError::InvalidPageId(_))
    ));
}

#[test]
fn test_disk_manager_persistence() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();
    let payload = b"survives a reopen";

    {
        let dm = DiskManager::new(&path).unwrap();
        for _ in 0..5 {
            dm.allocate_page().unwrap();
        }
        dm.deallocate_page(PageId::new(1)).unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[..payload.len()].copy_from_slice(payload);
        dm.write_page(PageId::new(3), &data).unwrap();
    }

    let dm = DiskManager::new(&path).unwrap();
    assert_eq!(dm.get_num_pages(), 4);
    assert!(dm.is_page_free(PageId::new(1)));
    assert!(!dm.is_page_free(PageId::new(3)));

    let mut data = [0u8; PAGE_SIZE];
    dm.read_page(PageId::new(3), &mut data).unwrap();
    assert_eq!(&data[..payload.len()], payload);

    assert_eq!(dm.allocate_page().unwrap(), PageId::new(1));
}

#[test]
fn test_disk_manager_rejects_foreign_file() {
    let temp_file = NamedTempFile::new().unwrap();
    {
        let mut file = OpenOptions::new()
            .write(true)
            .open(temp_file.path())
            .unwrap();
        file.write_all(&[0x5A; PAGE_SIZE]).unwrap();
    }

    assert!(matches!(
        DiskManager::new(temp_file.path()),
        Err(StrataError::CorruptFormat(_))
    ));
}

#[test]
fn test_disk_manager_concurrent_allocation() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let dm = Arc::clone(&dm);
            thread::spawn(move || {
                (0..25)
                    .map(|_| dm.allocate_page().unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for page_id in handle.join().unwrap() {
            assert!(seen.insert(page_id), "{} handed out twice", page_id);
        }
    }
    assert_eq!(seen.len(), 100);
    assert_eq!(dm.get_num_pages(), 100);
}
