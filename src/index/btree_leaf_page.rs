use std::cmp::Ordering;

use bytes::{Buf, BufMut, Bytes};

use crate::common::{PageId, Result, RowId, StrataError, INVALID_PAGE_ID};

use super::btree_page::{read_key, BTreePageHeader, PageType, BTREE_HEADER_SIZE};
use super::KeyComparator;

/// Leaf B+Tree page: `next_page_id` followed by `size` sorted (key, RowId)
/// pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub page_id: PageId,
    pub parent_page_id: PageId,
    pub key_size: usize,
    pub max_size: usize,
    /// Right sibling, INVALID_PAGE_ID for the last leaf
    pub next_page_id: PageId,
    entries: Vec<(Bytes, RowId)>,
}

impl LeafNode {
    pub fn new(page_id: PageId, parent_page_id: PageId, key_size: usize, max_size: usize) -> Self {
        Self {
            page_id,
            parent_page_id,
            key_size,
            max_size,
            next_page_id: INVALID_PAGE_ID,
            entries: Vec::with_capacity(max_size + 1),
        }
    }

    pub(crate) fn decode(header: &BTreePageHeader, data: &[u8]) -> Self {
        let mut buf = &data[BTREE_HEADER_SIZE..];
        let next_page_id = PageId::new(buf.get_u32_le());
        let entries = (0..header.size)
            .map(|_| {
                let key = read_key(&mut buf, header.key_size);
                let page_id = PageId::new(buf.get_u32_le());
                (key, RowId::new(page_id, buf.get_u32_le()))
            })
            .collect();

        Self {
            page_id: header.page_id,
            parent_page_id: header.parent_page_id,
            key_size: header.key_size,
            max_size: header.max_size,
            next_page_id,
            entries,
        }
    }

    pub fn encode(&self, data: &mut [u8]) {
        BTreePageHeader {
            page_type: PageType::Leaf,
            key_size: self.key_size,
            size: self.size(),
            max_size: self.max_size,
            parent_page_id: self.parent_page_id,
            page_id: self.page_id,
        }
        .encode(data);

        let mut out = &mut data[BTREE_HEADER_SIZE..];
        out.put_u32_le(self.next_page_id.as_u32());
        for (key, rid) in &self.entries {
            out.put_slice(key);
            out.put_u32_le(rid.page_id.as_u32());
            out.put_u32_le(rid.slot_num);
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[(Bytes, RowId)] {
        &self.entries
    }

    pub fn key_at(&self, index: usize) -> &Bytes {
        &self.entries[index].0
    }

    pub fn item(&self, index: usize) -> Option<&(Bytes, RowId)> {
        self.entries.get(index)
    }

    /// First index whose key is not less than `key`.
    pub fn key_index(&self, key: &[u8], cmp: &dyn KeyComparator) -> usize {
        self.entries
            .partition_point(|(k, _)| cmp.compare(k, key) == Ordering::Less)
    }

    pub fn lookup(&self, key: &[u8], cmp: &dyn KeyComparator) -> Option<RowId> {
        let index = self.key_index(key, cmp);
        match self.entries.get(index) {
            Some((k, rid)) if cmp.compare(k, key) == Ordering::Equal => Some(*rid),
            _ => None,
        }
    }

    /// Inserts in key order and returns the new size. A duplicate key is
    /// rejected and leaves the page unchanged.
    pub fn insert(&mut self, key: Bytes, value: RowId, cmp: &dyn KeyComparator) -> Result<usize> {
        let index = self.key_index(&key, cmp);
        if let Some((k, _)) = self.entries.get(index) {
            if cmp.compare(k, &key) == Ordering::Equal {
                return Err(StrataError::DuplicateKey);
            }
        }
        self.entries.insert(index, (key, value));
        Ok(self.size())
    }

    /// Removes `key` if present. Returns true if an entry was removed.
    pub fn remove_and_delete_record(&mut self, key: &[u8], cmp: &dyn KeyComparator) -> bool {
        let index = self.key_index(key, cmp);
        match self.entries.get(index) {
            Some((k, _)) if cmp.compare(k, key) == Ordering::Equal => {
                self.entries.remove(index);
                true
            }
            _ => false,
        }
    }

    /// Moves entries `[min_size..size)` to the empty `recipient`.
    pub fn move_half_to(&mut self, recipient: &mut LeafNode) {
        let split_at = super::btree_page::min_size(self.max_size);
        recipient.entries.extend(self.entries.split_off(split_at));
    }

    /// Appends every entry to `recipient`, the left sibling, which takes over
    /// this page's place in the leaf chain.
    pub fn move_all_to(&mut self, recipient: &mut LeafNode) {
        recipient.entries.append(&mut self.entries);
        recipient.next_page_id = self.next_page_id;
    }

    /// Moves the first entry to the end of `recipient`, the left sibling.
    /// Returns the new parent separator for this page.
    pub fn move_first_to_end_of(&mut self, recipient: &mut LeafNode) -> Option<Bytes> {
        if self.entries.len() < 2 {
            return None;
        }
        recipient.entries.push(self.entries.remove(0));
        Some(self.entries[0].0.clone())
    }

    /// Moves the last entry to the front of `recipient`, the right sibling.
    /// Returns the new parent separator for `recipient`.
    pub fn move_last_to_front_of(&mut self, recipient: &mut LeafNode) -> Option<Bytes> {
        if self.entries.len() < 2 {
            return None;
        }
        let entry = self.entries.pop()?;
        let separator = entry.0.clone();
        recipient.entries.insert(0, entry);
        Some(separator)
    }
}
