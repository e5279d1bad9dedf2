use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error};
use parking_lot::RwLock;

use crate::buffer::BufferPoolManager;
use crate::common::{
    IndexId, PageId, Result, RowId, StrataError, CATALOG_META_PAGE_ID, INDEX_ROOTS_PAGE_ID,
    INVALID_PAGE_ID,
};
use crate::storage::page::{IndexRootsPage, IndexRootsPageRef};

use super::btree_internal_page::InternalNode;
use super::btree_iterator::IndexIterator;
use super::btree_leaf_page::LeafNode;
use super::btree_page::{internal_max_size, leaf_max_size, write_parent_page_id, BTreeNode};
use super::KeyComparator;

const MIN_LEAF_MAX_SIZE: usize = 2;
const MIN_INTERNAL_MAX_SIZE: usize = 4;

/// Node sizing for a tree. Unset sizes default to the most that fits a page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BPlusTreeOptions {
    leaf_max_size: Option<usize>,
    internal_max_size: Option<usize>,
}

impl BPlusTreeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf_max_size(mut self, max_size: usize) -> Self {
        self.leaf_max_size = Some(max_size);
        self
    }

    pub fn internal_max_size(mut self, max_size: usize) -> Self {
        self.internal_max_size = Some(max_size);
        self
    }

    /// Resolves `(leaf_max_size, internal_max_size)` for keys of `key_size`.
    fn resolve(&self, key_size: usize) -> Result<(usize, usize)> {
        let leaf = check_size(
            "leaf",
            self.leaf_max_size,
            MIN_LEAF_MAX_SIZE,
            leaf_max_size(key_size),
        )?;
        let internal = check_size(
            "internal",
            self.internal_max_size,
            MIN_INTERNAL_MAX_SIZE,
            internal_max_size(key_size),
        )?;
        Ok((leaf, internal))
    }
}

fn check_size(kind: &'static str, requested: Option<usize>, min: usize, max: usize) -> Result<usize> {
    let size = requested.unwrap_or(max);
    if size < min || size > max {
        return Err(StrataError::InvalidNodeSize {
            kind,
            size,
            min,
            max,
        });
    }
    Ok(size)
}

fn reconcile_size(kind: &'static str, requested: Option<usize>, persisted: usize) -> Result<usize> {
    match requested {
        Some(size) if size != persisted => Err(StrataError::InvalidNodeSize {
            kind,
            size,
            min: persisted,
            max: persisted,
        }),
        _ => Ok(persisted),
    }
}

/// Shape of a tree as seen by [`BPlusTree::validate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels, 0 for an empty tree
    pub height: usize,
    pub leaf_count: usize,
    pub internal_count: usize,
    pub entry_count: usize,
}

/// Outcome of fixing up a node after a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebalance {
    /// The node was within bounds and was written back as is.
    Unchanged,
    /// One entry was borrowed from a sibling.
    Redistributed,
    /// The given page was merged away and deleted.
    Merged(PageId),
}

/// A disk-resident B+Tree over fixed-width keys with unique `RowId` values.
///
/// Every node access goes through the buffer pool. A node is decoded from its
/// page, changed in memory and encoded back, so at most one page is pinned at
/// a time. The root page id is recorded in the index roots page and survives
/// a restart.
///
/// Structural changes take the tree latch exclusively. Lookups and iterator
/// construction share it.
pub struct BPlusTree {
    index_id: IndexId,
    bpm: Arc<BufferPoolManager>,
    comparator: Arc<dyn KeyComparator>,
    key_size: usize,
    leaf_max_size: usize,
    internal_max_size: usize,
    root_page_id: RwLock<PageId>,
}

impl BPlusTree {
    /// Opens the index `index_id`, creating the reserved pages on a fresh file.
    pub fn new(
        index_id: IndexId,
        bpm: Arc<BufferPoolManager>,
        comparator: Arc<dyn KeyComparator>,
        key_size: usize,
        options: BPlusTreeOptions,
    ) -> Result<Self> {
        let (leaf_max_size, internal_max_size) = options.resolve(key_size)?;

        ensure_reserved_pages(&bpm)?;
        let root_page_id = {
            let guard = bpm.fetch_page_read(INDEX_ROOTS_PAGE_ID)?;
            IndexRootsPageRef::new(&guard)
                .get_root_id(index_id)?
                .unwrap_or(INVALID_PAGE_ID)
        };
        debug!("opened index {} with root {}", index_id, root_page_id);

        let mut tree = Self {
            index_id,
            bpm,
            comparator,
            key_size,
            leaf_max_size,
            internal_max_size,
            root_page_id: RwLock::new(root_page_id),
        };
        if root_page_id.is_valid() {
            tree.adopt_persisted_sizes(&options)?;
        }
        Ok(tree)
    }

    /// Takes node sizes from an existing tree. Explicitly requested sizes
    /// must match what the pages were built with.
    fn adopt_persisted_sizes(&mut self, options: &BPlusTreeOptions) -> Result<()> {
        let root = *self.root_page_id.get_mut();
        if let BTreeNode::Internal(node) = self.fetch_node(root)? {
            self.internal_max_size =
                reconcile_size("internal", options.internal_max_size, node.max_size)?;
        }
        let leaf = self.find_leaf(root, None)?;
        self.leaf_max_size = reconcile_size("leaf", options.leaf_max_size, leaf.max_size)?;
        debug!(
            "index {} uses leaf size {}, internal size {}",
            self.index_id, self.leaf_max_size, self.internal_max_size
        );
        Ok(())
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn leaf_max_size(&self) -> usize {
        self.leaf_max_size
    }

    pub fn internal_max_size(&self) -> usize {
        self.internal_max_size
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    /// Point lookup.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<RowId>> {
        self.check_key(key)?;
        let root = self.root_page_id.read();
        if !root.is_valid() {
            return Ok(None);
        }
        let leaf = self.find_leaf(*root, Some(key))?;
        Ok(leaf.lookup(key, self.comparator.as_ref()))
    }

    /// Inserts a unique key. A duplicate is rejected with `DuplicateKey` and
    /// leaves the tree unchanged.
    ///
    /// A `BufferPoolFull` from a split may leave the tree partially updated.
    pub fn insert(&self, key: &[u8], value: RowId) -> Result<()> {
        self.check_key(key)?;
        let mut root = self.root_page_id.write();
        let key = Bytes::copy_from_slice(key);

        if !root.is_valid() {
            return self.start_new_tree(&mut root, key, value);
        }

        let mut leaf = self.find_leaf(*root, Some(&key))?;
        if leaf.insert(key, value, self.comparator.as_ref())? <= leaf.max_size {
            return self.write_node(&BTreeNode::Leaf(leaf));
        }

        let sibling_id = self.allocate_page()?;
        let mut sibling = LeafNode::new(
            sibling_id,
            leaf.parent_page_id,
            self.key_size,
            leaf.max_size,
        );
        leaf.move_half_to(&mut sibling);
        sibling.next_page_id = leaf.next_page_id;
        leaf.next_page_id = sibling_id;
        let separator = sibling.key_at(0).clone();
        debug!(
            "split leaf {} into {} ({} + {} entries)",
            leaf.page_id,
            sibling_id,
            leaf.size(),
            sibling.size()
        );

        let (leaf_id, parent_id) = (leaf.page_id, leaf.parent_page_id);
        self.write_node(&BTreeNode::Leaf(leaf))?;
        self.write_node(&BTreeNode::Leaf(sibling))?;
        self.insert_into_parent(&mut root, leaf_id, parent_id, separator, sibling_id)
    }

    /// Removes a key. Returns false if it was not present.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        let mut root = self.root_page_id.write();
        if !root.is_valid() {
            return Ok(false);
        }

        let mut leaf = self.find_leaf(*root, Some(key))?;
        if !leaf.remove_and_delete_record(key, self.comparator.as_ref()) {
            return Ok(false);
        }

        let outcome = self.coalesce_or_redistribute(&mut root, BTreeNode::Leaf(leaf))?;
        if outcome != Rebalance::Unchanged {
            debug!("remove rebalanced: {:?}", outcome);
        }
        Ok(true)
    }

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> Result<IndexIterator> {
        let root = self.root_page_id.read();
        if !root.is_valid() {
            return Ok(self.end());
        }
        let leaf = self.find_leaf(*root, None)?;
        IndexIterator::new(Arc::clone(&self.bpm), self.key_size, leaf, 0)
    }

    /// Iterator positioned at the first key not less than `key`.
    pub fn begin_at(&self, key: &[u8]) -> Result<IndexIterator> {
        self.check_key(key)?;
        let root = self.root_page_id.read();
        if !root.is_valid() {
            return Ok(self.end());
        }
        let leaf = self.find_leaf(*root, Some(key))?;
        let index = leaf.key_index(key, self.comparator.as_ref());
        IndexIterator::new(Arc::clone(&self.bpm), self.key_size, leaf, index)
    }

    /// The past-the-end position.
    pub fn end(&self) -> IndexIterator {
        IndexIterator::end(Arc::clone(&self.bpm), self.key_size)
    }

    /// Deletes every page of the tree and forgets its root.
    pub fn destroy(&self) -> Result<()> {
        let mut root = self.root_page_id.write();
        let mut pending = Vec::new();
        if root.is_valid() {
            pending.push(*root);
        }

        let mut deleted = 0usize;
        while let Some(page_id) = pending.pop() {
            if let BTreeNode::Internal(node) = self.fetch_node(page_id)? {
                pending.extend(node.children());
            }
            self.bpm.delete_page(page_id)?;
            deleted += 1;
        }

        self.update_root(&mut root, INVALID_PAGE_ID)?;
        debug!("destroyed index {} ({} pages)", self.index_id, deleted);
        Ok(())
    }

    /// Renders the tree as a Graphviz digraph. Each node is a table of its
    /// keys; edges run from parents to children and along the leaf chain.
    pub fn to_dot(&self) -> Result<String> {
        let root = self.root_page_id.read();
        let mut out = String::from("digraph G {\n");
        if root.is_valid() {
            self.dot_subtree(*root, &mut out)?;
        }
        out.push_str("}\n");
        Ok(out)
    }

    fn dot_subtree(&self, page_id: PageId, out: &mut String) -> Result<()> {
        let node = self.fetch_node(page_id)?;
        let (prefix, color) = if node.is_leaf() {
            ("LEAF_", "green")
        } else {
            ("INT_", "pink")
        };
        let id = page_id.as_u32();
        out.push_str(&format!(
            "{}{}[shape=plain color={} label=<<TABLE BORDER=\"0\" CELLBORDER=\"1\" CELLSPACING=\"0\" CELLPADDING=\"4\">\n",
            prefix, id, color
        ));
        out.push_str(&format!(
            "<TR><TD COLSPAN=\"{}\">P={},Parent={}</TD></TR>\n",
            node.size(),
            id,
            node.parent_page_id()
        ));
        out.push_str(&format!(
            "<TR><TD COLSPAN=\"{}\">max_size={},min_size={},size={}</TD></TR>\n<TR>",
            node.size(),
            node.max_size(),
            node.min_size(),
            node.size()
        ));

        match node {
            BTreeNode::Leaf(leaf) => {
                for (key, _) in leaf.entries() {
                    out.push_str(&format!("<TD>{}</TD>", self.comparator.format_key(key)));
                }
                out.push_str("</TR></TABLE>>];\n");
                if leaf.next_page_id.is_valid() {
                    let next = leaf.next_page_id.as_u32();
                    out.push_str(&format!("LEAF_{} -> LEAF_{};\n", id, next));
                    out.push_str(&format!("{{rank=same LEAF_{} LEAF_{}}};\n", id, next));
                }
            }
            BTreeNode::Internal(internal) => {
                for (i, (key, child)) in internal.entries().iter().enumerate() {
                    let label = if i == 0 {
                        String::new()
                    } else {
                        self.comparator.format_key(key)
                    };
                    out.push_str(&format!("<TD PORT=\"p{}\">{}</TD>", child.as_u32(), label));
                }
                out.push_str("</TR></TABLE>>];\n");
                for child in internal.children() {
                    let child_prefix = if self.fetch_node(child)?.is_leaf() {
                        "LEAF_"
                    } else {
                        "INT_"
                    };
                    out.push_str(&format!(
                        "INT_{}:p{} -> {}{};\n",
                        id,
                        child.as_u32(),
                        child_prefix,
                        child.as_u32()
                    ));
                    self.dot_subtree(child, out)?;
                }
            }
        }
        Ok(())
    }

    /// Renders every node on its own lines, parents before children.
    pub fn dump(&self) -> Result<String> {
        let root = self.root_page_id.read();
        let mut out = String::new();
        if root.is_valid() {
            self.dump_subtree(*root, &mut out)?;
        }
        Ok(out)
    }

    fn dump_subtree(&self, page_id: PageId, out: &mut String) -> Result<()> {
        match self.fetch_node(page_id)? {
            BTreeNode::Leaf(leaf) => {
                out.push_str(&format!(
                    "Leaf {} parent: {} next: {}\n",
                    page_id, leaf.parent_page_id, leaf.next_page_id
                ));
                let keys: Vec<String> = leaf
                    .entries()
                    .iter()
                    .map(|(key, _)| self.comparator.format_key(key))
                    .collect();
                out.push_str(&keys.join(","));
                out.push('\n');
            }
            BTreeNode::Internal(internal) => {
                out.push_str(&format!(
                    "Internal {} parent: {}\n",
                    page_id, internal.parent_page_id
                ));
                let entries: Vec<String> = internal
                    .entries()
                    .iter()
                    .enumerate()
                    .map(|(i, (key, child))| {
                        if i == 0 {
                            format!("_: {}", child)
                        } else {
                            format!("{}: {}", self.comparator.format_key(key), child)
                        }
                    })
                    .collect();
                out.push_str(&entries.join(","));
                out.push('\n');
                for child in internal.children() {
                    self.dump_subtree(child, out)?;
                }
            }
        }
        Ok(())
    }

    /// Returns true if the buffer pool holds no pins. Every leaked pin is
    /// logged.
    pub fn check(&self) -> bool {
        self.bpm.check_all_unpinned()
    }

    /// Walks the whole tree and checks its structural invariants: key order,
    /// separator bounds, parent pointers, occupancy, uniform leaf depth and
    /// the leaf chain.
    pub fn validate(&self) -> Result<TreeStats> {
        let root = self.root_page_id.read();
        let mut stats = TreeStats::default();
        if !root.is_valid() {
            return Ok(stats);
        }

        let mut walk = ValidateWalk {
            leaves: Vec::new(),
            leaf_depth: None,
            stats: &mut stats,
        };
        self.validate_subtree(*root, INVALID_PAGE_ID, None, None, 1, &mut walk)?;
        let height = walk.leaf_depth.unwrap_or(0);
        let leaves = walk.leaves;
        stats.height = height;

        // The leaf chain must visit exactly the in-order leaves
        let mut page_id = leaves[0];
        for (i, &expected) in leaves.iter().enumerate() {
            if page_id != expected {
                return Err(corrupted(format!(
                    "leaf chain reaches {} at position {}, expected {}",
                    page_id, i, expected
                )));
            }
            page_id = match self.fetch_node(page_id)? {
                BTreeNode::Leaf(leaf) => leaf.next_page_id,
                BTreeNode::Internal(_) => {
                    return Err(corrupted(format!("leaf chain reaches internal {}", page_id)))
                }
            };
        }
        if page_id.is_valid() {
            return Err(corrupted(format!("last leaf links to {}", page_id)));
        }

        Ok(stats)
    }

    fn validate_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<&Bytes>,
        upper: Option<&Bytes>,
        depth: usize,
        walk: &mut ValidateWalk<'_>,
    ) -> Result<()> {
        let node = self.fetch_node(page_id)?;
        let cmp = self.comparator.as_ref();

        if node.page_id() != page_id {
            return Err(corrupted(format!("{} claims to be {}", page_id, node.page_id())));
        }
        if node.parent_page_id() != expected_parent {
            return Err(corrupted(format!(
                "{} points at parent {}, expected {}",
                page_id,
                node.parent_page_id(),
                expected_parent
            )));
        }

        let min = if node.is_root() {
            if node.is_leaf() {
                1
            } else {
                2
            }
        } else {
            node.min_size()
        };
        if node.size() < min || node.size() > node.max_size() {
            return Err(corrupted(format!(
                "{} holds {} entries, allowed {}..={}",
                page_id,
                node.size(),
                min,
                node.max_size()
            )));
        }

        let in_bounds = |key: &Bytes| {
            lower.map_or(true, |lo| cmp.compare(key, lo) != Ordering::Less)
                && upper.map_or(true, |hi| cmp.compare(key, hi) == Ordering::Less)
        };

        match node {
            BTreeNode::Leaf(leaf) => {
                let keys: Vec<&Bytes> = leaf.entries().iter().map(|(k, _)| k).collect();
                check_keys(page_id, &keys, cmp, &in_bounds)?;

                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(d) if d != depth => {
                        return Err(corrupted(format!(
                            "leaf {} at depth {}, other leaves at {}",
                            page_id, depth, d
                        )))
                    }
                    Some(_) => {}
                }
                walk.leaves.push(page_id);
                walk.stats.leaf_count += 1;
                walk.stats.entry_count += leaf.size();
            }
            BTreeNode::Internal(internal) => {
                let keys: Vec<&Bytes> = internal.entries()[1..].iter().map(|(k, _)| k).collect();
                check_keys(page_id, &keys, cmp, &in_bounds)?;
                walk.stats.internal_count += 1;

                let size = internal.size();
                for i in 0..size {
                    let child_lower = if i == 0 { lower } else { Some(internal.key_at(i)) };
                    let child_upper = if i + 1 < size {
                        Some(internal.key_at(i + 1))
                    } else {
                        upper
                    };
                    self.validate_subtree(
                        internal.value_at(i),
                        page_id,
                        child_lower,
                        child_upper,
                        depth + 1,
                        walk,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(StrataError::KeySizeMismatch {
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }

    /// Descends to the leaf whose range contains `key`, or to the leftmost
    /// leaf when `key` is None.
    fn find_leaf(&self, root: PageId, key: Option<&[u8]>) -> Result<LeafNode> {
        let mut page_id = root;
        loop {
            match self.fetch_node(page_id)? {
                BTreeNode::Leaf(leaf) => return Ok(leaf),
                BTreeNode::Internal(node) => {
                    page_id = match key {
                        Some(key) => node.lookup(key, self.comparator.as_ref()),
                        None => node.value_at(0),
                    };
                }
            }
        }
    }

    fn start_new_tree(&self, root: &mut PageId, key: Bytes, value: RowId) -> Result<()> {
        let page_id = self.allocate_page()?;
        let mut leaf = LeafNode::new(page_id, INVALID_PAGE_ID, self.key_size, self.leaf_max_size);
        leaf.insert(key, value, self.comparator.as_ref())?;
        self.write_node(&BTreeNode::Leaf(leaf))?;
        self.update_root(root, page_id)
    }

    /// Links `new_id`, split off from `old_id`, into the parent under
    /// `separator`, splitting ancestors as needed.
    fn insert_into_parent(
        &self,
        root: &mut PageId,
        old_id: PageId,
        parent_id: PageId,
        separator: Bytes,
        new_id: PageId,
    ) -> Result<()> {
        if !parent_id.is_valid() {
            let root_id = self.allocate_page()?;
            let mut new_root =
                InternalNode::new(root_id, INVALID_PAGE_ID, self.key_size, self.internal_max_size);
            new_root.populate_new_root(old_id, separator, new_id);
            self.write_node(&BTreeNode::Internal(new_root))?;
            self.set_parent(old_id, root_id)?;
            self.set_parent(new_id, root_id)?;
            return self.update_root(root, root_id);
        }

        let mut parent = self.fetch_internal(parent_id)?;
        let size = parent
            .insert_node_after(old_id, separator, new_id)
            .ok_or_else(|| corrupted(format!("{} is not a child of {}", old_id, parent_id)))?;
        if size <= parent.max_size {
            return self.write_node(&BTreeNode::Internal(parent));
        }

        let sibling_id = self.allocate_page()?;
        let mut sibling = InternalNode::new(
            sibling_id,
            parent.parent_page_id,
            self.key_size,
            parent.max_size,
        );
        let moved = parent.move_half_to(&mut sibling);
        let separator = sibling.key_at(0).clone();
        debug!(
            "split internal {} into {} ({} + {} children)",
            parent_id,
            sibling_id,
            parent.size(),
            sibling.size()
        );

        let grandparent_id = parent.parent_page_id;
        self.write_node(&BTreeNode::Internal(parent))?;
        self.write_node(&BTreeNode::Internal(sibling))?;
        for child in moved {
            self.set_parent(child, sibling_id)?;
        }
        self.insert_into_parent(root, parent_id, grandparent_id, separator, sibling_id)
    }

    /// Writes `node` back, first fixing an underflow by borrowing from or
    /// merging with a sibling. Merges cascade to the parent.
    fn coalesce_or_redistribute(&self, root: &mut PageId, node: BTreeNode) -> Result<Rebalance> {
        if node.is_root() {
            return self.adjust_root(root, node);
        }
        if node.size() >= node.min_size() {
            self.write_node(&node)?;
            return Ok(Rebalance::Unchanged);
        }

        let mut parent = self.fetch_internal(node.parent_page_id())?;
        let index = parent.value_index(node.page_id()).ok_or_else(|| {
            corrupted(format!("{} is not a child of {}", node.page_id(), parent.page_id))
        })?;
        let sibling_index = if index == 0 { 1 } else { index - 1 };
        if sibling_index >= parent.size() {
            return Err(corrupted(format!(
                "{} has no sibling under {}",
                node.page_id(),
                parent.page_id
            )));
        }
        let sibling = self.fetch_node(parent.value_at(sibling_index))?;

        if sibling.size() > sibling.min_size() {
            self.redistribute(node, sibling, &mut parent, index)?;
            self.write_node(&BTreeNode::Internal(parent))?;
            return Ok(Rebalance::Redistributed);
        }

        // Merge the right page into the left one
        let (left, right, right_index) = if index == 0 {
            (node, sibling, 1)
        } else {
            (sibling, node, index)
        };
        let right_id = right.page_id();
        let middle_key = parent.key_at(right_index).clone();

        match (left, right) {
            (BTreeNode::Leaf(mut left), BTreeNode::Leaf(mut right)) => {
                right.move_all_to(&mut left);
                self.write_node(&BTreeNode::Leaf(left))?;
            }
            (BTreeNode::Internal(mut left), BTreeNode::Internal(mut right)) => {
                let moved = right.move_all_to(&mut left, middle_key);
                let left_id = left.page_id;
                self.write_node(&BTreeNode::Internal(left))?;
                for child in moved {
                    self.set_parent(child, left_id)?;
                }
            }
            _ => {
                return Err(corrupted(format!(
                    "siblings under {} differ in kind",
                    parent.page_id
                )))
            }
        }

        self.bpm.delete_page(right_id)?;
        parent.remove(right_index);
        debug!("merged {} into its left sibling", right_id);

        self.coalesce_or_redistribute(root, BTreeNode::Internal(parent))?;
        Ok(Rebalance::Merged(right_id))
    }

    /// Moves one entry from `sibling` into `node` and fixes the separator in
    /// `parent`. `index` is the position of `node` under `parent`. The parent
    /// itself is written by the caller.
    fn redistribute(
        &self,
        node: BTreeNode,
        sibling: BTreeNode,
        parent: &mut InternalNode,
        index: usize,
    ) -> Result<()> {
        let parent_id = parent.page_id;
        let no_spare = || corrupted(format!("sibling under {} has no entry to spare", parent_id));
        match (node, sibling) {
            (BTreeNode::Leaf(mut node), BTreeNode::Leaf(mut sibling)) => {
                if index == 0 {
                    let separator = sibling.move_first_to_end_of(&mut node).ok_or_else(no_spare)?;
                    parent.set_key_at(1, separator);
                } else {
                    let separator = sibling.move_last_to_front_of(&mut node).ok_or_else(no_spare)?;
                    parent.set_key_at(index, separator);
                }
                self.write_node(&BTreeNode::Leaf(node))?;
                self.write_node(&BTreeNode::Leaf(sibling))?;
            }
            (BTreeNode::Internal(mut node), BTreeNode::Internal(mut sibling)) => {
                let separator_index = if index == 0 { 1 } else { index };
                let middle_key = parent.key_at(separator_index).clone();
                let (child, separator) = if index == 0 {
                    sibling.move_first_to_end_of(&mut node, middle_key)
                } else {
                    sibling.move_last_to_front_of(&mut node, middle_key)
                }
                .ok_or_else(no_spare)?;
                parent.set_key_at(separator_index, separator);

                let node_id = node.page_id;
                self.write_node(&BTreeNode::Internal(node))?;
                self.write_node(&BTreeNode::Internal(sibling))?;
                self.set_parent(child, node_id)?;
            }
            _ => return Err(corrupted(format!("siblings under {} differ in kind", parent_id))),
        }
        debug!("redistributed one entry under {}", parent_id);
        Ok(())
    }

    /// Handles a root that shrank: an internal root with one child hands the
    /// root over to that child, and an empty leaf root empties the tree.
    fn adjust_root(&self, root: &mut PageId, node: BTreeNode) -> Result<Rebalance> {
        match node {
            BTreeNode::Internal(mut old_root) if old_root.size() == 1 => {
                let child = old_root.remove_and_return_only_child();
                self.set_parent(child, INVALID_PAGE_ID)?;
                self.bpm.delete_page(old_root.page_id)?;
                self.update_root(root, child)?;
                Ok(Rebalance::Merged(old_root.page_id))
            }
            BTreeNode::Leaf(old_root) if old_root.size() == 0 => {
                self.bpm.delete_page(old_root.page_id)?;
                self.update_root(root, INVALID_PAGE_ID)?;
                Ok(Rebalance::Merged(old_root.page_id))
            }
            node => {
                self.write_node(&node)?;
                Ok(Rebalance::Unchanged)
            }
        }
    }

    /// Records a new root in memory and in the index roots page.
    fn update_root(&self, root: &mut PageId, new_root: PageId) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(INDEX_ROOTS_PAGE_ID)?;
        let mut roots = IndexRootsPage::new(guard.data_mut());
        if new_root.is_valid() {
            roots.upsert(self.index_id, new_root)?;
        } else {
            roots.delete(self.index_id)?;
        }
        debug!("index {} root {} -> {}", self.index_id, *root, new_root);
        *root = new_root;
        Ok(())
    }

    fn allocate_page(&self) -> Result<PageId> {
        match self.bpm.new_page() {
            Ok(guard) => Ok(guard.page_id()),
            Err(e) => {
                error!("index {} could not allocate a node page: {}", self.index_id, e);
                Err(e)
            }
        }
    }

    fn fetch_node(&self, page_id: PageId) -> Result<BTreeNode> {
        let guard = self.bpm.fetch_page_read(page_id)?;
        BTreeNode::decode(&guard, self.key_size)
    }

    fn fetch_internal(&self, page_id: PageId) -> Result<InternalNode> {
        match self.fetch_node(page_id)? {
            BTreeNode::Internal(node) => Ok(node),
            BTreeNode::Leaf(_) => Err(corrupted(format!("parent {} is a leaf", page_id))),
        }
    }

    fn write_node(&self, node: &BTreeNode) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(node.page_id())?;
        node.encode(guard.data_mut());
        Ok(())
    }

    fn set_parent(&self, page_id: PageId, parent_page_id: PageId) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(page_id)?;
        write_parent_page_id(guard.data_mut(), parent_page_id);
        Ok(())
    }
}

/// State carried through a validation walk.
struct ValidateWalk<'a> {
    leaves: Vec<PageId>,
    leaf_depth: Option<usize>,
    stats: &'a mut TreeStats,
}

fn check_keys(
    page_id: PageId,
    keys: &[&Bytes],
    cmp: &dyn KeyComparator,
    in_bounds: &dyn Fn(&Bytes) -> bool,
) -> Result<()> {
    for pair in keys.windows(2) {
        if cmp.compare(pair[0], pair[1]) != Ordering::Less {
            return Err(corrupted(format!("keys out of order in {}", page_id)));
        }
    }
    if let Some(key) = keys.iter().find(|k| !in_bounds(k)) {
        return Err(corrupted(format!(
            "key {:?} in {} is outside its separators",
            key, page_id
        )));
    }
    Ok(())
}

fn corrupted(msg: String) -> StrataError {
    StrataError::IndexCorrupted(msg)
}

/// Makes sure the catalog meta page and the index roots page exist.
fn ensure_reserved_pages(bpm: &BufferPoolManager) -> Result<()> {
    if !bpm.is_page_free(INDEX_ROOTS_PAGE_ID) {
        return Ok(());
    }

    loop {
        let mut guard = bpm.new_page()?;
        let page_id = guard.page_id();
        if page_id == CATALOG_META_PAGE_ID {
            debug!("reserved catalog meta page");
            continue;
        }
        if page_id == INDEX_ROOTS_PAGE_ID {
            IndexRootsPage::new(guard.data_mut()).init();
            debug!("created index roots page");
            return Ok(());
        }
        if page_id.as_u32() > INDEX_ROOTS_PAGE_ID.as_u32() {
            drop(guard);
            bpm.delete_page(page_id)?;
            return Err(StrataError::CorruptFormat(format!(
                "{} is free but allocation skipped it",
                INDEX_ROOTS_PAGE_ID
            )));
        }
    }
}
