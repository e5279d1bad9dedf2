use bytes::{Buf, BufMut, Bytes};

use crate::common::{PageId, Result, StrataError, PAGE_SIZE};

use super::btree_internal_page::InternalNode;
use super::btree_leaf_page::LeafNode;

/// Size of the header shared by every B+Tree page.
pub const BTREE_HEADER_SIZE: usize = 24;
/// Leaf pages append `next_page_id` to the shared header.
pub const LEAF_HEADER_SIZE: usize = BTREE_HEADER_SIZE + 4;

const PARENT_PAGE_OFFSET: usize = 16;

/// Child pointer width in internal pages.
pub const CHILD_SIZE: usize = 4;
/// RowId width in leaf pages.
pub const ROW_ID_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Invalid,
    Leaf,
    Internal,
}

impl PageType {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PageType::Invalid),
            1 => Some(PageType::Leaf),
            2 => Some(PageType::Internal),
            _ => None,
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            PageType::Invalid => 0,
            PageType::Leaf => 1,
            PageType::Internal => 2,
        }
    }
}

/// Header shared by internal and leaf pages.
///
/// Layout (little-endian u32s):
/// ```text
/// | page_type | key_size | size | max_size | parent_page_id | page_id |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreePageHeader {
    pub page_type: PageType,
    pub key_size: usize,
    pub size: usize,
    pub max_size: usize,
    pub parent_page_id: PageId,
    pub page_id: PageId,
}

impl BTreePageHeader {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BTREE_HEADER_SIZE {
            return Err(StrataError::CorruptFormat(format!(
                "B+Tree page of {} bytes",
                data.len()
            )));
        }

        let mut buf = &data[..BTREE_HEADER_SIZE];
        let raw_type = buf.get_u32_le();
        let page_type = PageType::from_u32(raw_type).ok_or_else(|| {
            StrataError::CorruptFormat(format!("unknown B+Tree page type {}", raw_type))
        })?;

        Ok(Self {
            page_type,
            key_size: buf.get_u32_le() as usize,
            size: buf.get_u32_le() as usize,
            max_size: buf.get_u32_le() as usize,
            parent_page_id: PageId::new(buf.get_u32_le()),
            page_id: PageId::new(buf.get_u32_le()),
        })
    }

    pub fn encode(&self, data: &mut [u8]) {
        let mut out = &mut data[..BTREE_HEADER_SIZE];
        out.put_u32_le(self.page_type.as_u32());
        out.put_u32_le(self.key_size as u32);
        out.put_u32_le(self.size as u32);
        out.put_u32_le(self.max_size as u32);
        out.put_u32_le(self.parent_page_id.as_u32());
        out.put_u32_le(self.page_id.as_u32());
    }
}

/// Largest internal page size that fits one page for keys of `key_size` bytes.
pub fn internal_max_size(key_size: usize) -> usize {
    ((PAGE_SIZE - BTREE_HEADER_SIZE) / (key_size + CHILD_SIZE)).saturating_sub(1)
}

/// Largest leaf page size that fits one page for keys of `key_size` bytes.
pub fn leaf_max_size(key_size: usize) -> usize {
    ((PAGE_SIZE - LEAF_HEADER_SIZE) / (key_size + ROW_ID_SIZE)).saturating_sub(1)
}

/// Fewest entries a non-root page may hold.
pub fn min_size(max_size: usize) -> usize {
    max_size / 2
}

/// Rewrites the parent pointer of an encoded page without decoding it.
pub fn write_parent_page_id(data: &mut [u8], parent_page_id: PageId) {
    data[PARENT_PAGE_OFFSET..PARENT_PAGE_OFFSET + 4]
        .copy_from_slice(&parent_page_id.as_u32().to_le_bytes());
}

/// A decoded B+Tree page.
///
/// Nodes are decoded from a pinned page, changed in memory and encoded back.
/// Decoding checks the page type, the key width and that the entries fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BTreeNode {
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl BTreeNode {
    pub fn decode(data: &[u8], key_size: usize) -> Result<Self> {
        let header = BTreePageHeader::decode(data)?;

        if header.key_size != key_size {
            return Err(StrataError::CorruptFormat(format!(
                "{} has key size {}, index uses {}",
                header.page_id, header.key_size, key_size
            )));
        }

        let capacity = match header.page_type {
            PageType::Internal => internal_max_size(key_size) + 1,
            PageType::Leaf => leaf_max_size(key_size) + 1,
            PageType::Invalid => {
                return Err(StrataError::CorruptFormat(format!(
                    "{} is not a B+Tree page",
                    header.page_id
                )))
            }
        };
        let empty_internal = header.page_type == PageType::Internal && header.size == 0;
        if header.size > header.max_size || header.max_size > capacity || empty_internal {
            return Err(StrataError::CorruptFormat(format!(
                "{} holds {} of max {} entries, page fits {}",
                header.page_id, header.size, header.max_size, capacity
            )));
        }

        match header.page_type {
            PageType::Internal => Ok(BTreeNode::Internal(InternalNode::decode(&header, data))),
            _ => Ok(BTreeNode::Leaf(LeafNode::decode(&header, data))),
        }
    }

    pub fn encode(&self, data: &mut [u8]) {
        match self {
            BTreeNode::Internal(node) => node.encode(data),
            BTreeNode::Leaf(node) => node.encode(data),
        }
    }

    pub fn page_id(&self) -> PageId {
        match self {
            BTreeNode::Internal(node) => node.page_id,
            BTreeNode::Leaf(node) => node.page_id,
        }
    }

    pub fn parent_page_id(&self) -> PageId {
        match self {
            BTreeNode::Internal(node) => node.parent_page_id,
            BTreeNode::Leaf(node) => node.parent_page_id,
        }
    }

    pub fn set_parent_page_id(&mut self, parent_page_id: PageId) {
        match self {
            BTreeNode::Internal(node) => node.parent_page_id = parent_page_id,
            BTreeNode::Leaf(node) => node.parent_page_id = parent_page_id,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            BTreeNode::Internal(node) => node.size(),
            BTreeNode::Leaf(node) => node.size(),
        }
    }

    pub fn max_size(&self) -> usize {
        match self {
            BTreeNode::Internal(node) => node.max_size,
            BTreeNode::Leaf(node) => node.max_size,
        }
    }

    pub fn min_size(&self) -> usize {
        min_size(self.max_size())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, BTreeNode::Leaf(_))
    }

    pub fn is_root(&self) -> bool {
        !self.parent_page_id().is_valid()
    }
}

/// Copies a fixed-width key out of an encoded page.
pub(crate) fn read_key(buf: &mut &[u8], key_size: usize) -> Bytes {
    let key = Bytes::copy_from_slice(&buf[..key_size]);
    buf.advance(key_size);
    key
}
