use std::ops::{Deref, DerefMut};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{FrameId, PageId, PAGE_SIZE};

use super::BufferPoolManager;

/// Identifies one pin on one mapping of a frame.
///
/// The generation lets the pool reject a release that arrives after the frame
/// has been remapped to another page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PinToken {
    pub(crate) page_id: PageId,
    pub(crate) frame_id: FrameId,
    pub(crate) generation: u64,
}

/// RAII guard for read-only access to a page.
/// Unpins the page when dropped.
pub struct ReadPageGuard<'a> {
    bpm: &'a BufferPoolManager,
    token: PinToken,
    data: Option<RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>>,
    released: bool,
}

impl<'a> ReadPageGuard<'a> {
    pub(crate) fn new(bpm: &'a BufferPoolManager, token: PinToken) -> Self {
        let data = bpm.frame(token.frame_id).read_data();
        Self {
            bpm,
            token,
            data: Some(data),
            released: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.token.page_id
    }

    pub(crate) fn token(&self) -> PinToken {
        self.token
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..],
            None => &[],
        }
    }

    /// Gives up the data latch but keeps the pin. The caller becomes
    /// responsible for a matching `unpin_page(page_id, false)`.
    pub fn detach(mut self) -> PageId {
        self.data.take();
        self.released = true;
        self.token.page_id
    }
}

impl Deref for ReadPageGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard<'_> {
    fn drop(&mut self) {
        // Release the latch before taking the pool latch
        self.data.take();
        if !self.released {
            self.bpm.release_pin(self.token, false);
        }
    }
}

/// RAII guard for read-write access to a page.
/// Marks the page dirty if it was written through, then unpins it on drop.
pub struct WritePageGuard<'a> {
    bpm: &'a BufferPoolManager,
    token: PinToken,
    data: Option<RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>>,
    is_dirty: bool,
    released: bool,
}

impl<'a> WritePageGuard<'a> {
    pub(crate) fn new(bpm: &'a BufferPoolManager, token: PinToken) -> Self {
        let data = bpm.frame(token.frame_id).write_data();
        Self {
            bpm,
            token,
            data: Some(data),
            is_dirty: false,
            released: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.token.page_id
    }

    pub(crate) fn token(&self) -> PinToken {
        self.token
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..],
            None => &[],
        }
    }

    /// Returns a mutable reference to the page data and marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.is_dirty = true;
        match &mut self.data {
            Some(data) => &mut data[..],
            None => &mut [],
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    /// Gives up the data latch but keeps the pin. Writes made through this
    /// guard are recorded as dirty immediately. The caller becomes responsible
    /// for a matching `unpin_page`.
    pub fn detach(mut self) -> PageId {
        self.data.take();
        if self.is_dirty {
            self.bpm.mark_dirty(self.token);
        }
        self.released = true;
        self.token.page_id
    }
}

impl Deref for WritePageGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard<'_> {
    fn drop(&mut self) {
        // Release the latch before taking the pool latch
        self.data.take();
        if !self.released {
            self.bpm.release_pin(self.token, self.is_dirty);
        }
    }
}
