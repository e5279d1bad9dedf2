use std::cmp::Ordering;

use bytes::{Buf, BufMut, Bytes};

use crate::common::PageId;

use super::btree_page::{read_key, BTreePageHeader, PageType, BTREE_HEADER_SIZE};
use super::KeyComparator;

/// Internal B+Tree page: `size` (key, child) pairs after the shared header.
///
/// The key at index 0 is unused. Child `i` covers keys in `[key_i, key_{i+1})`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub page_id: PageId,
    pub parent_page_id: PageId,
    pub key_size: usize,
    pub max_size: usize,
    entries: Vec<(Bytes, PageId)>,
}

impl InternalNode {
    pub fn new(page_id: PageId, parent_page_id: PageId, key_size: usize, max_size: usize) -> Self {
        Self {
            page_id,
            parent_page_id,
            key_size,
            max_size,
            entries: Vec::with_capacity(max_size + 1),
        }
    }

    pub(crate) fn decode(header: &BTreePageHeader, data: &[u8]) -> Self {
        let mut buf = &data[BTREE_HEADER_SIZE..];
        let entries = (0..header.size)
            .map(|_| {
                let key = read_key(&mut buf, header.key_size);
                (key, PageId::new(buf.get_u32_le()))
            })
            .collect();

        Self {
            page_id: header.page_id,
            parent_page_id: header.parent_page_id,
            key_size: header.key_size,
            max_size: header.max_size,
            entries,
        }
    }

    pub fn encode(&self, data: &mut [u8]) {
        BTreePageHeader {
            page_type: PageType::Internal,
            key_size: self.key_size,
            size: self.size(),
            max_size: self.max_size,
            parent_page_id: self.parent_page_id,
            page_id: self.page_id,
        }
        .encode(data);

        let mut out = &mut data[BTREE_HEADER_SIZE..];
        for (key, child) in &self.entries {
            out.put_slice(key);
            out.put_u32_le(child.as_u32());
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[(Bytes, PageId)] {
        &self.entries
    }

    pub fn key_at(&self, index: usize) -> &Bytes {
        &self.entries[index].0
    }

    pub fn set_key_at(&mut self, index: usize, key: Bytes) {
        self.entries[index].0 = key;
    }

    pub fn value_at(&self, index: usize) -> PageId {
        self.entries[index].1
    }

    /// Index of the entry pointing at `child`.
    pub fn value_index(&self, child: PageId) -> Option<usize> {
        self.entries.iter().position(|&(_, c)| c == child)
    }

    pub fn children(&self) -> impl Iterator<Item = PageId> + '_ {
        self.entries.iter().map(|&(_, child)| child)
    }

    /// Index of the child whose range contains `key`: the greatest `i >= 1`
    /// with `key_i <= key`, or 0 if there is none.
    pub fn child_index(&self, key: &[u8], cmp: &dyn KeyComparator) -> usize {
        if self.entries.len() <= 1 {
            return 0;
        }
        self.entries[1..].partition_point(|(k, _)| cmp.compare(k, key) != Ordering::Greater)
    }

    /// Child page whose range contains `key`.
    pub fn lookup(&self, key: &[u8], cmp: &dyn KeyComparator) -> PageId {
        self.value_at(self.child_index(key, cmp))
    }

    /// Turns an empty page into a root over two children.
    pub fn populate_new_root(&mut self, old_child: PageId, key: Bytes, new_child: PageId) {
        self.entries.clear();
        self.entries.push((Bytes::from(vec![0u8; key.len()]), old_child));
        self.entries.push((key, new_child));
    }

    /// Inserts `(key, new_child)` right after the entry for `old_child` and
    /// returns the new size, or None if `old_child` is not a child here.
    pub fn insert_node_after(
        &mut self,
        old_child: PageId,
        key: Bytes,
        new_child: PageId,
    ) -> Option<usize> {
        let index = self.value_index(old_child)?;
        self.entries.insert(index + 1, (key, new_child));
        Some(self.size())
    }

    pub fn remove(&mut self, index: usize) {
        self.entries.remove(index);
    }

    /// Empties a single-child root and returns that child.
    pub fn remove_and_return_only_child(&mut self) -> PageId {
        debug_assert_eq!(self.size(), 1);
        let (_, child) = self.entries.remove(0);
        child
    }

    /// Moves entries `[min_size..size)` to the empty `recipient`. Returns the
    /// moved children, which now belong to `recipient`.
    pub fn move_half_to(&mut self, recipient: &mut InternalNode) -> Vec<PageId> {
        let split_at = super::btree_page::min_size(self.max_size);
        let moved = self.entries.split_off(split_at);
        let children = moved.iter().map(|&(_, child)| child).collect();
        recipient.entries.extend(moved);
        children
    }

    /// Appends every entry to `recipient`, the left sibling. `middle_key` is
    /// the parent's separator for this page and replaces the unused key 0.
    pub fn move_all_to(&mut self, recipient: &mut InternalNode, middle_key: Bytes) -> Vec<PageId> {
        if let Some(first) = self.entries.first_mut() {
            first.0 = middle_key;
        }
        let children = self.children().collect();
        recipient.entries.append(&mut self.entries);
        children
    }

    /// Moves the first child to the end of `recipient`, the left sibling.
    /// Returns the moved child and the new parent separator for this page,
    /// or None if this page cannot spare a child.
    pub fn move_first_to_end_of(
        &mut self,
        recipient: &mut InternalNode,
        middle_key: Bytes,
    ) -> Option<(PageId, Bytes)> {
        if self.entries.len() < 2 {
            return None;
        }
        let (_, child) = self.entries.remove(0);
        recipient.entries.push((middle_key, child));
        Some((child, self.entries[0].0.clone()))
    }

    /// Moves the last child to the front of `recipient`, the right sibling.
    /// Returns the moved child and the new parent separator for `recipient`,
    /// or None if this page cannot spare a child.
    pub fn move_last_to_front_of(
        &mut self,
        recipient: &mut InternalNode,
        middle_key: Bytes,
    ) -> Option<(PageId, Bytes)> {
        if self.entries.len() < 2 {
            return None;
        }
        let (key, child) = self.entries.pop()?;
        if let Some(first) = recipient.entries.first_mut() {
            first.0 = middle_key;
        }
        recipient.entries.insert(0, (key.clone(), child));
        Some((child, key))
    }
}
