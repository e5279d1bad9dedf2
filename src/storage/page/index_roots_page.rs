use crate::common::{IndexId, PageId, Result, StrataError, PAGE_SIZE};

const COUNT_OFFSET: usize = 0;
const ENTRIES_OFFSET: usize = 4;
const ENTRY_SIZE: usize = 8; // index_id (4) + root_page_id (4)

/// Maximum number of indexes one roots page can record.
pub const MAX_INDEX_ROOTS: usize = (PAGE_SIZE - ENTRIES_OFFSET) / ENTRY_SIZE;

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn entry_offset(index: usize) -> usize {
    ENTRIES_OFFSET + index * ENTRY_SIZE
}

fn count(data: &[u8]) -> usize {
    read_u32(data, COUNT_OFFSET) as usize
}

fn find(data: &[u8], index_id: IndexId) -> Result<Option<usize>> {
    let n = count(data);
    if n > MAX_INDEX_ROOTS {
        return Err(StrataError::CorruptFormat(format!(
            "index roots page records {} entries, at most {} fit",
            n, MAX_INDEX_ROOTS
        )));
    }
    Ok((0..n).find(|&i| read_u32(data, entry_offset(i)) == index_id))
}

fn root_at(data: &[u8], index: usize) -> PageId {
    PageId::new(read_u32(data, entry_offset(index) + 4))
}

/// Mutable view of the page that maps index ids to their B+Tree root pages.
///
/// Layout (little-endian):
/// ```text
/// | count (4) | (index_id (4), root_page_id (4)) * count |
/// ```
pub struct IndexRootsPage<'a> {
    data: &'a mut [u8],
}

impl<'a> IndexRootsPage<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn init(&mut self) {
        self.data.fill(0);
    }

    pub fn count(&self) -> usize {
        count(self.data)
    }

    pub fn get_root_id(&self, index_id: IndexId) -> Result<Option<PageId>> {
        Ok(find(self.data, index_id)?.map(|i| root_at(self.data, i)))
    }

    /// Records a new index. Returns false if the index is already present.
    pub fn insert(&mut self, index_id: IndexId, root_page_id: PageId) -> Result<bool> {
        if find(self.data, index_id)?.is_some() {
            return Ok(false);
        }
        let n = self.count();
        if n >= MAX_INDEX_ROOTS {
            return Err(StrataError::IndexRootsFull);
        }
        self.set_entry(n, index_id, root_page_id);
        self.set_count(n + 1);
        Ok(true)
    }

    /// Changes the root of a recorded index. Returns false if it is unknown.
    pub fn update(&mut self, index_id: IndexId, root_page_id: PageId) -> Result<bool> {
        match find(self.data, index_id)? {
            Some(i) => {
                self.set_entry(i, index_id, root_page_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Inserts or updates the root of `index_id`.
    pub fn upsert(&mut self, index_id: IndexId, root_page_id: PageId) -> Result<()> {
        if !self.update(index_id, root_page_id)? {
            self.insert(index_id, root_page_id)?;
        }
        Ok(())
    }

    /// Removes an index, keeping the remaining entries contiguous.
    pub fn delete(&mut self, index_id: IndexId) -> Result<bool> {
        let Some(pos) = find(self.data, index_id)? else {
            return Ok(false);
        };
        let n = self.count();
        let start = entry_offset(pos + 1);
        let end = entry_offset(n);
        self.data.copy_within(start..end, entry_offset(pos));
        self.data[entry_offset(n - 1)..end].fill(0);
        self.set_count(n - 1);
        Ok(true)
    }

    fn set_count(&mut self, n: usize) {
        self.data[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&(n as u32).to_le_bytes());
    }

    fn set_entry(&mut self, index: usize, index_id: IndexId, root_page_id: PageId) {
        let offset = entry_offset(index);
        self.data[offset..offset + 4].copy_from_slice(&index_id.to_le_bytes());
        self.data[offset + 4..offset + 8].copy_from_slice(&root_page_id.as_u32().to_le_bytes());
    }
}

/// Read-only view of the index roots page.
pub struct IndexRootsPageRef<'a> {
    data: &'a [u8],
}

impl<'a> IndexRootsPageRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn count(&self) -> usize {
        count(self.data)
    }

    pub fn get_root_id(&self, index_id: IndexId) -> Result<Option<PageId>> {
        Ok(find(self.data, index_id)?.map(|i| root_at(self.data, i)))
    }
}
