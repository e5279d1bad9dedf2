use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::BufferPoolManager;
use crate::common::{PageId, Result, RowId, StrataError, INVALID_PAGE_ID};

use super::btree_leaf_page::LeafNode;
use super::btree_page::BTreeNode;

/// Forward iterator over the leaf chain in key order.
///
/// The iterator keeps a decoded copy of the current leaf and pins nothing
/// between calls. It follows `next_page_id` when a leaf runs out.
///
/// Any `insert`, `remove` or `destroy` on the tree invalidates every open
/// iterator. Entries of the current leaf are still yielded from the copy,
/// but the rest of the scan may skip keys, repeat them or fail with a
/// decode error once a freed page is reused. Create a fresh iterator after
/// changing the tree.
pub struct IndexIterator {
    bpm: Arc<BufferPoolManager>,
    key_size: usize,
    /// INVALID_PAGE_ID once past the end
    page_id: PageId,
    index: usize,
    leaf: Option<LeafNode>,
    error: Option<StrataError>,
}

impl IndexIterator {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        key_size: usize,
        leaf: LeafNode,
        index: usize,
    ) -> Result<Self> {
        let mut iter = Self {
            bpm,
            key_size,
            page_id: leaf.page_id,
            index,
            leaf: Some(leaf),
            error: None,
        };
        iter.skip_exhausted()?;
        Ok(iter)
    }

    pub(crate) fn end(bpm: Arc<BufferPoolManager>, key_size: usize) -> Self {
        Self {
            bpm,
            key_size,
            page_id: INVALID_PAGE_ID,
            index: 0,
            leaf: None,
            error: None,
        }
    }

    pub fn is_end(&self) -> bool {
        !self.page_id.is_valid()
    }

    /// Entry at the current position, None at the end.
    pub fn current(&self) -> Option<&(Bytes, RowId)> {
        self.leaf.as_ref()?.item(self.index)
    }

    /// Moves past exhausted leaves until the position names an entry or the
    /// chain ends.
    fn skip_exhausted(&mut self) -> Result<()> {
        loop {
            let next_page_id = match &self.leaf {
                None => return Ok(()),
                Some(leaf) if self.index < leaf.size() => return Ok(()),
                Some(leaf) => leaf.next_page_id,
            };

            if !next_page_id.is_valid() {
                self.page_id = INVALID_PAGE_ID;
                self.index = 0;
                self.leaf = None;
                return Ok(());
            }

            let node = {
                let guard = self.bpm.fetch_page_read(next_page_id)?;
                BTreeNode::decode(&guard, self.key_size)?
            };
            match node {
                BTreeNode::Leaf(leaf) => {
                    self.page_id = next_page_id;
                    self.index = 0;
                    self.leaf = Some(leaf);
                }
                BTreeNode::Internal(_) => {
                    return Err(StrataError::IndexCorrupted(format!(
                        "leaf chain reaches internal {}",
                        next_page_id
                    )))
                }
            }
        }
    }
}

impl Iterator for IndexIterator {
    type Item = Result<(Bytes, RowId)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            self.page_id = INVALID_PAGE_ID;
            self.leaf = None;
            return Some(Err(e));
        }

        let item = self.current()?.clone();
        self.index += 1;
        if let Err(e) = self.skip_exhausted() {
            self.error = Some(e);
        }
        Some(Ok(item))
    }
}

impl PartialEq for IndexIterator {
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && self.index == other.index
    }
}

impl std::fmt::Debug for IndexIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexIterator")
            .field("page_id", &self.page_id)
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::BufferPoolManager;
    use crate::common::{PageId, RowId};
    use crate::index::{BPlusTree, BPlusTreeOptions, IntegerComparator};
    use crate::storage::disk::DiskManager;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn key(v: i32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn create_tree() -> (BPlusTree, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(8, dm));
        let options = BPlusTreeOptions::new().leaf_max_size(3).internal_max_size(4);
        let tree = BPlusTree::new(0, bpm, Arc::new(IntegerComparator), 4, options).unwrap();
        (tree, temp_file)
    }

    #[test]
    fn test_empty_tree_iterates_nothing() {
        let (tree, _temp) = create_tree();
        let iter = tree.begin().unwrap();
        assert!(iter.is_end());
        assert_eq!(iter, tree.end());
        assert_eq!(tree.begin().unwrap().count(), 0);
    }

    #[test]
    fn test_iterates_across_leaves() {
        let (tree, _temp) = create_tree();
        for v in (0..20).rev() {
            tree.insert(&key(v * 2), RowId::new(PageId::new(v as u32), 0)).unwrap();
        }

        let keys: Vec<i32> = tree
            .begin()
            .unwrap()
            .map(|item| {
                let (k, _) = item.unwrap();
                i32::from_le_bytes(k[..4].try_into().unwrap())
            })
            .collect();
        assert_eq!(keys, (0..20).map(|v| v * 2).collect::<Vec<_>>());
        assert!(tree.check());
    }

    #[test]
    fn test_begin_at_positions_on_lower_bound() {
        let (tree, _temp) = create_tree();
        for v in 0..20 {
            tree.insert(&key(v * 2), RowId::new(PageId::new(v as u32), 0)).unwrap();
        }

        let mut iter = tree.begin_at(&key(7)).unwrap();
        assert_eq!(iter.current().unwrap().0.as_ref(), &key(8));
        let (k, rid) = iter.next().unwrap().unwrap();
        assert_eq!(k.as_ref(), &key(8));
        assert_eq!(rid.page_id, PageId::new(4));

        let iter = tree.begin_at(&key(38)).unwrap();
        assert_eq!(iter.count(), 1);
        assert!(tree.begin_at(&key(39)).unwrap().is_end());
    }

    #[test]
    fn test_iterator_yields_stale_leaf_after_remove() {
        let (tree, _temp) = create_tree();
        for v in 0..3 {
            tree.insert(&key(v), RowId::new(PageId::new(v as u32), 0)).unwrap();
        }

        let mut iter = tree.begin().unwrap();
        assert!(tree.remove(&key(1)).unwrap());

        // The copy taken before the remove still holds the removed key
        let keys: Vec<i32> = iter
            .by_ref()
            .map(|item| i32::from_le_bytes(item.unwrap().0[..4].try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![0, 1, 2]);
        assert!(iter.is_end());

        let fresh: Vec<_> = tree.begin().unwrap().map(|item| item.unwrap().1).collect();
        assert_eq!(fresh.len(), 2);
    }
}
