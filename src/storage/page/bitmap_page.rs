use crate::common::{BITMAP_HEADER_SIZE, BITMAP_SIZE, PAGE_SIZE};

const PAGE_ALLOCATED_OFFSET: usize = 0;
const NEXT_FREE_PAGE_OFFSET: usize = 4;
const BYTES_OFFSET: usize = BITMAP_HEADER_SIZE;

/// Allocation bitmap for one extent of data pages.
///
/// Layout (little-endian):
/// ```text
/// | page_allocated (4) | next_free_page (4) | bitmap bytes (PAGE_SIZE - 8) |
/// ```
/// Bit `i` lives in byte `i / 8`, most significant bit first.
#[derive(Clone)]
pub struct BitmapPage {
    data: Box<[u8; PAGE_SIZE]>,
}

impl BitmapPage {
    /// Creates an empty bitmap with no pages allocated.
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Builds a bitmap from the raw bytes of a bitmap page.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        data.copy_from_slice(bytes);
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    /// Number of pages this bitmap can track.
    pub fn max_supported_size() -> u32 {
        BITMAP_SIZE
    }

    pub fn allocated_count(&self) -> u32 {
        self.read_u32(PAGE_ALLOCATED_OFFSET)
    }

    fn set_allocated_count(&mut self, count: u32) {
        self.write_u32(PAGE_ALLOCATED_OFFSET, count);
    }

    /// Hint: no page below this offset is free.
    pub fn next_free_page(&self) -> u32 {
        self.read_u32(NEXT_FREE_PAGE_OFFSET)
    }

    fn set_next_free_page(&mut self, offset: u32) {
        self.write_u32(NEXT_FREE_PAGE_OFFSET, offset);
    }

    pub fn is_full(&self) -> bool {
        self.allocated_count() >= BITMAP_SIZE
    }

    /// Marks the lowest free page as allocated and returns its offset.
    pub fn allocate_page(&mut self) -> Option<u32> {
        if self.is_full() {
            return None;
        }

        let mut offset = self.next_free_page();
        while offset < BITMAP_SIZE && !self.is_page_free(offset) {
            offset += 1;
        }
        if offset >= BITMAP_SIZE {
            return None;
        }

        let (byte, mask) = Self::locate(offset);
        self.data[BYTES_OFFSET + byte] |= mask;
        self.set_allocated_count(self.allocated_count() + 1);

        let mut next = offset + 1;
        while next < BITMAP_SIZE && !self.is_page_free(next) {
            next += 1;
        }
        self.set_next_free_page(next);

        Some(offset)
    }

    /// Clears the bit for `offset`. Returns false if the offset is out of range
    /// or was not allocated.
    pub fn deallocate_page(&mut self, offset: u32) -> bool {
        if offset >= BITMAP_SIZE || self.allocated_count() == 0 || self.is_page_free(offset) {
            return false;
        }

        let (byte, mask) = Self::locate(offset);
        self.data[BYTES_OFFSET + byte] &= !mask;
        self.set_allocated_count(self.allocated_count() - 1);

        if offset < self.next_free_page() {
            self.set_next_free_page(offset);
        }
        true
    }

    /// Out-of-range offsets are reported as not free.
    pub fn is_page_free(&self, offset: u32) -> bool {
        if offset >= BITMAP_SIZE {
            return false;
        }
        let (byte, mask) = Self::locate(offset);
        self.data[BYTES_OFFSET + byte] & mask == 0
    }

    fn locate(offset: u32) -> (usize, u8) {
        let byte = (offset / 8) as usize;
        let bit = offset % 8;
        (byte, 1u8 << (7 - bit))
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let bytes: [u8; 4] = self.data[offset..offset + 4]
            .try_into()
            .expect("slice is 4 bytes");
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for BitmapPage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_allocates_in_order() {
        let mut bitmap = BitmapPage::new();
        for expected in 0..10 {
            assert_eq!(bitmap.allocate_page(), Some(expected));
        }
        assert_eq!(bitmap.allocated_count(), 10);
        assert_eq!(bitmap.next_free_page(), 10);
    }

    #[test]
    fn test_bitmap_reuses_lowest_freed_page() {
        let mut bitmap = BitmapPage::new();
        for _ in 0..8 {
            bitmap.allocate_page().unwrap();
        }

        assert!(bitmap.deallocate_page(5));
        assert!(bitmap.deallocate_page(2));
        assert!(bitmap.is_page_free(2));
        assert!(bitmap.is_page_free(5));

        assert_eq!(bitmap.allocate_page(), Some(2));
        assert_eq!(bitmap.allocate_page(), Some(5));
        assert_eq!(bitmap.allocate_page(), Some(8));
    }

    #[test]
    fn test_bitmap_rejects_bad_deallocation() {
        let mut bitmap = BitmapPage::new();
        assert!(!bitmap.deallocate_page(0));

        bitmap.allocate_page().unwrap();
        assert!(!bitmap.deallocate_page(1));
        assert!(!bitmap.deallocate_page(BITMAP_SIZE));
        assert!(bitmap.deallocate_page(0));
        assert!(!bitmap.deallocate_page(0));
    }

    #[test]
    fn test_bitmap_msb_first_layout() {
        let mut bitmap = BitmapPage::new();
        bitmap.allocate_page().unwrap();
        assert_eq!(bitmap.as_bytes()[BYTES_OFFSET], 0b1000_0000);

        bitmap.allocate_page().unwrap();
        assert_eq!(bitmap.as_bytes()[BYTES_OFFSET], 0b1100_0000);
    }

    #[test]
    fn test_bitmap_fills_up() {
        let mut bitmap = BitmapPage::new();
        for _ in 0..BitmapPage::max_supported_size() {
            assert!(bitmap.allocate_page().is_some());
        }
        assert!(bitmap.is_full());
        assert_eq!(bitmap.allocate_page(), None);
        assert!(!bitmap.is_page_free(BITMAP_SIZE));
    }

    #[test]
    fn test_bitmap_survives_bytes() {
        let mut bitmap = BitmapPage::new();
        bitmap.allocate_page().unwrap();
        bitmap.allocate_page().unwrap();
        bitmap.deallocate_page(0);

        let copy = BitmapPage::from_bytes(bitmap.as_bytes());
        assert_eq!(copy.allocated_count(), 1);
        assert_eq!(copy.next_free_page(), 0);
        assert!(copy.is_page_free(0));
        assert!(!copy.is_page_free(1));
    }
}
