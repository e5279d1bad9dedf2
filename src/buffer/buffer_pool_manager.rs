use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::common::{FrameId, PageId, Result, StrataError, PAGE_SIZE};
use crate::storage::disk::DiskManager;

use super::page_guard::PinToken;
use super::{FrameHeader, LruReplacer, ReadPageGuard, Replacer, WritePageGuard};

/// Bookkeeping protected by the pool latch.
struct PoolState {
    /// Page table: maps page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Frames that hold no page
    free_list: VecDeque<FrameId>,
    /// Eviction policy over resident, unpinned frames
    replacer: Box<dyn Replacer>,
}

/// BufferPoolManager is responsible for fetching database pages from disk
/// and caching them in a fixed set of frames.
///
/// Every successful fetch or `new_page` pins the page once. Guards release
/// that pin when dropped. A pinned page is never evicted. When every frame is
/// pinned, fetching a non-resident page fails with `BufferPoolFull`.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    /// The buffer pool frames
    frames: Vec<FrameHeader>,
    /// Pool latch
    state: Mutex<PoolState>,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    /// Creates a pool of `pool_size` frames with LRU replacement.
    pub fn new(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::with_replacer(
            pool_size,
            disk_manager,
            Box::new(LruReplacer::new(pool_size)),
        )
    }

    /// Creates a pool with a custom replacement policy.
    pub fn with_replacer(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        replacer: Box<dyn Replacer>,
    ) -> Self {
        let frames = (0..pool_size)
            .map(|i| FrameHeader::new(FrameId::new(i as u32)))
            .collect();
        let free_list = (0..pool_size).map(|i| FrameId::new(i as u32)).collect();

        Self {
            pool_size,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
                replacer,
            }),
            disk_manager,
        }
    }

    /// Fetches a page for read access, reading it from disk if necessary.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard<'_>> {
        let token = self.pin_page(page_id)?;
        Ok(ReadPageGuard::new(self, token))
    }

    /// Fetches a page for write access, reading it from disk if necessary.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard<'_>> {
        let token = self.pin_page(page_id)?;
        Ok(WritePageGuard::new(self, token))
    }

    /// Allocates a new zero-filled page and returns it pinned for writing.
    pub fn new_page(&self) -> Result<WritePageGuard<'_>> {
        let token = {
            let mut state = self.state.lock();
            let frame_id = self.acquire_frame(&mut state)?;

            let page_id = match self.disk_manager.allocate_page() {
                Ok(page_id) => page_id,
                Err(e) => {
                    state.free_list.push_back(frame_id);
                    return Err(e);
                }
            };

            let frame = self.frame(frame_id);
            frame.reset();
            let generation = frame.install(page_id);
            state.page_table.insert(page_id, frame_id);
            debug!("new page {} in {}", page_id, frame_id);

            PinToken {
                page_id,
                frame_id,
                generation,
            }
        };
        Ok(WritePageGuard::new(self, token))
    }

    /// Drops one pin on a resident page. `is_dirty` is OR'ed into the frame's
    /// dirty flag. Returns false if the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            warn!("unpin of non-resident {}", page_id);
            return false;
        };
        Self::unpin_frame(&mut state, self.frame(frame_id), is_dirty)
    }

    /// Removes a page from the pool and releases its id on disk.
    ///
    /// Fails with `PageStillPinned` if the page is resident and pinned, in
    /// which case the disk id stays allocated.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        if !page_id.is_valid() {
            return Err(StrataError::InvalidPageId(page_id));
        }

        {
            let mut state = self.state.lock();
            if let Some(&frame_id) = state.page_table.get(&page_id) {
                let frame = self.frame(frame_id);
                if frame.pin_count() > 0 {
                    return Err(StrataError::PageStillPinned(page_id));
                }
                if frame.is_dirty() {
                    self.write_back(frame)?;
                }
                state.page_table.remove(&page_id);
                state.replacer.pin(frame_id);
                frame.reset();
                state.free_list.push_back(frame_id);
            }
        }

        self.disk_manager.deallocate_page(page_id)?;
        debug!("deleted {}", page_id);
        Ok(())
    }

    /// Writes a resident page to disk and clears its dirty flag.
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Err(StrataError::InvalidPageId(page_id));
        }

        // Pin so the frame cannot be evicted while the pool latch is released
        let token = {
            let mut state = self.state.lock();
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                warn!("flush of non-resident {}", page_id);
                return Ok(false);
            };
            let frame = self.frame(frame_id);
            frame.pin();
            state.replacer.pin(frame_id);
            frame.set_dirty(false);
            PinToken {
                page_id,
                frame_id,
                generation: frame.generation(),
            }
        };

        let mut buf = [0u8; PAGE_SIZE];
        self.frame(token.frame_id).copy_to(&mut buf);
        let result = self.disk_manager.write_page(page_id, &buf);

        // A failed write leaves the page dirty
        self.release_pin(token, result.is_err());
        result?;
        Ok(true)
    }

    /// Flushes every resident page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let resident: Vec<PageId> = self.state.lock().page_table.keys().copied().collect();
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Returns true if no frame is pinned. Each pinned frame is logged.
    pub fn check_all_unpinned(&self) -> bool {
        let _state = self.state.lock();
        let mut all_unpinned = true;
        for frame in &self.frames {
            let pins = frame.pin_count();
            if pins > 0 {
                error!(
                    "{} holding {} is still pinned {} time(s)",
                    frame.frame_id(),
                    frame.page_id(),
                    pins
                );
                all_unpinned = false;
            }
        }
        all_unpinned
    }

    /// Returns true if the disk allocator considers `page_id` free.
    pub fn is_page_free(&self, page_id: PageId) -> bool {
        self.disk_manager.is_page_free(page_id)
    }

    /// Returns the pin count for a resident page.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.frame(frame_id).pin_count())
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of frames holding no page.
    pub fn free_frame_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of resident pages that could be evicted right now.
    pub fn evictable_count(&self) -> usize {
        self.state.lock().replacer.size()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    pub(crate) fn frame(&self, frame_id: FrameId) -> &FrameHeader {
        &self.frames[frame_id.as_usize()]
    }

    /// Releases a pin taken by a guard. A token whose frame has since been
    /// remapped is logged and ignored.
    pub(crate) fn release_pin(&self, token: PinToken, is_dirty: bool) -> bool {
        let mut state = self.state.lock();
        let frame = self.frame(token.frame_id);
        if frame.generation() != token.generation || frame.page_id() != token.page_id {
            error!(
                "stale pin on {} for {} (generation {}, frame is at {})",
                token.frame_id,
                token.page_id,
                token.generation,
                frame.generation()
            );
            return false;
        }
        Self::unpin_frame(&mut state, frame, is_dirty)
    }

    pub(crate) fn mark_dirty(&self, token: PinToken) {
        let _state = self.state.lock();
        let frame = self.frame(token.frame_id);
        if frame.generation() == token.generation {
            frame.set_dirty(true);
        }
    }

    fn unpin_frame(state: &mut PoolState, frame: &FrameHeader, is_dirty: bool) -> bool {
        if frame.pin_count() == 0 {
            warn!("unpin of {} which is not pinned", frame.page_id());
            return false;
        }
        if is_dirty {
            frame.set_dirty(true);
        }
        if let Some(0) = frame.unpin() {
            state.replacer.unpin(frame.frame_id());
        }
        true
    }

    fn pin_page(&self, page_id: PageId) -> Result<PinToken> {
        if !page_id.is_valid() {
            return Err(StrataError::InvalidPageId(page_id));
        }

        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = self.frame(frame_id);
            frame.pin();
            state.replacer.pin(frame_id);
            return Ok(PinToken {
                page_id,
                frame_id,
                generation: frame.generation(),
            });
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let frame = self.frame(frame_id);

        // The frame is unpinned, so no guard holds its latch
        let read = {
            let mut data = frame.write_data();
            self.disk_manager.read_page(page_id, &mut data[..])
        };
        if let Err(e) = read {
            frame.reset();
            state.free_list.push_back(frame_id);
            return Err(e);
        }

        let generation = frame.install(page_id);
        state.page_table.insert(page_id, frame_id);
        trace!("loaded {} into {}", page_id, frame_id);

        Ok(PinToken {
            page_id,
            frame_id,
            generation,
        })
    }

    /// Takes a frame from the free list, or evicts the replacer's victim.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = state.replacer.victim() else {
            return Err(StrataError::BufferPoolFull);
        };
        let frame = self.frame(frame_id);
        let old_page_id = frame.page_id();

        if frame.is_dirty() {
            if let Err(e) = self.write_back(frame) {
                state.replacer.unpin(frame_id);
                return Err(e);
            }
        }

        state.page_table.remove(&old_page_id);
        frame.reset();
        trace!("evicted {} from {}", old_page_id, frame_id);
        Ok(frame_id)
    }

    fn write_back(&self, frame: &FrameHeader) -> Result<()> {
        let mut buf = [0u8; PAGE_SIZE];
        frame.copy_to(&mut buf);
        self.disk_manager.write_page(frame.page_id(), &buf)?;
        frame.set_dirty(false);
        Ok(())
    }
}

impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        for frame in &self.frames {
            if frame.page_id().is_valid() && frame.is_dirty() {
                if let Err(e) = self.write_back(frame) {
                    error!("failed to write back {} on shutdown: {}", frame.page_id(), e);
                }
            }
        }
    }
}
