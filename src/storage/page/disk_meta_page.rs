use crate::common::{Result, StrataError, DISK_META_MAGIC, PAGE_SIZE};

const MAGIC_OFFSET: usize = 0;
const NUM_ALLOCATED_OFFSET: usize = 4;
const NUM_EXTENTS_OFFSET: usize = 8;
const EXTENT_USED_OFFSET: usize = 12;

/// Maximum number of extents one meta page can describe.
pub const MAX_EXTENTS: usize = (PAGE_SIZE - EXTENT_USED_OFFSET) / 4;

/// Contents of physical page 0 of a database file.
///
/// Layout (little-endian):
/// ```text
/// | magic (4) | num_allocated_pages (4) | num_extents (4) | extent_used_page[num_extents] (4 each) |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskFileMeta {
    pub num_allocated_pages: u32,
    pub extent_used_page: Vec<u32>,
}

impl DiskFileMeta {
    pub fn new() -> Self {
        Self {
            num_allocated_pages: 0,
            extent_used_page: Vec::new(),
        }
    }

    pub fn num_extents(&self) -> u32 {
        self.extent_used_page.len() as u32
    }

    /// Decodes a meta page. A bad magic number or an impossible extent count
    /// means the file is not ours or has been damaged.
    pub fn decode(data: &[u8]) -> Result<Self> {
        assert_eq!(data.len(), PAGE_SIZE);

        let magic = read_u32(data, MAGIC_OFFSET);
        if magic != DISK_META_MAGIC {
            return Err(StrataError::CorruptFormat(format!(
                "disk meta magic {:#010x}, expected {:#010x}",
                magic, DISK_META_MAGIC
            )));
        }

        let num_allocated_pages = read_u32(data, NUM_ALLOCATED_OFFSET);
        let num_extents = read_u32(data, NUM_EXTENTS_OFFSET) as usize;
        if num_extents > MAX_EXTENTS {
            return Err(StrataError::CorruptFormat(format!(
                "disk meta claims {} extents, at most {} fit",
                num_extents, MAX_EXTENTS
            )));
        }

        let extent_used_page: Vec<u32> = (0..num_extents)
            .map(|i| read_u32(data, EXTENT_USED_OFFSET + i * 4))
            .collect();

        let total: u64 = extent_used_page.iter().map(|&n| n as u64).sum();
        if total != num_allocated_pages as u64 {
            return Err(StrataError::CorruptFormat(format!(
                "disk meta counts {} allocated pages but extents hold {}",
                num_allocated_pages, total
            )));
        }

        Ok(Self {
            num_allocated_pages,
            extent_used_page,
        })
    }

    pub fn encode(&self, data: &mut [u8]) {
        assert_eq!(data.len(), PAGE_SIZE);
        debug_assert!(self.extent_used_page.len() <= MAX_EXTENTS);

        data.fill(0);
        write_u32(data, MAGIC_OFFSET, DISK_META_MAGIC);
        write_u32(data, NUM_ALLOCATED_OFFSET, self.num_allocated_pages);
        write_u32(data, NUM_EXTENTS_OFFSET, self.num_extents());
        for (i, &used) in self.extent_used_page.iter().enumerate() {
            write_u32(data, EXTENT_USED_OFFSET + i * 4, used);
        }
    }
}

impl Default for DiskFileMeta {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_encode_decode() {
        let meta = DiskFileMeta {
            num_allocated_pages: 7,
            extent_used_page: vec![5, 2],
        };

        let mut data = [0u8; PAGE_SIZE];
        meta.encode(&mut data);

        assert_eq!(&data[0..4], &DISK_META_MAGIC.to_le_bytes());
        assert_eq!(DiskFileMeta::decode(&data).unwrap(), meta);
    }

    #[test]
    fn test_meta_rejects_bad_magic() {
        let data = [0u8; PAGE_SIZE];
        let err = DiskFileMeta::decode(&data).unwrap_err();
        assert!(matches!(err, StrataError::CorruptFormat(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_meta_rejects_inconsistent_counts() {
        let meta = DiskFileMeta {
            num_allocated_pages: 3,
            extent_used_page: vec![3],
        };
        let mut data = [0u8; PAGE_SIZE];
        meta.encode(&mut data);
        data[NUM_ALLOCATED_OFFSET..NUM_ALLOCATED_OFFSET + 4].copy_from_slice(&9u32.to_le_bytes());

        assert!(matches!(
            DiskFileMeta::decode(&data),
            Err(StrataError::CorruptFormat(_))
        ));
    }
}
