mod frame;
mod replacer;

use std::collections::LinkedList;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use parking_lot::FairMutex;

use crate::disk_manager::{DiskManager, DISK_STORAGE};
use crate::errors::Error;
use crate::hash::ExtendibleHashTable;
use crate::logging::LogManager;
use crate::pages::{Page, PageId, INVALID_PAGE_ID};

pub use frame::Frame;
use replacer::Replacer;

const BUFFER_POOL_SIZE: usize = 10_000;
const PAGE_TABLE_BUCKET_CAPACITY: usize = 64;

pub type FrameId = usize;
pub type ArcBufferPool = Arc<FairMutex<BufferPoolManager>>;

/// Fixed-capacity frame cache over a disk manager. Every frame is either in
/// the page table (pinned, or unpinned and tracked by the replacer) or in
/// the free list.
pub struct BufferPoolManager {
    disk_manager: DiskManager,
    log_manager: Option<Arc<LogManager>>,

    free_frames: LinkedList<FrameId>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    frames: Vec<Frame>,

    replacer: Box<dyn Replacer>,
}

impl BufferPoolManager {
    pub fn get() -> ArcBufferPool {
        BUFFER_POOL.clone()
    }

    pub fn new(pool_size: usize, path: &str) -> Result<Self> {
        let frames = (0..pool_size).map(|_| Frame::new()).collect::<Vec<_>>();

        Ok(Self {
            disk_manager: DiskManager::new(path)?,
            log_manager: None,
            free_frames: LinkedList::from_iter(0..pool_size),
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_CAPACITY),
            frames,
            replacer: Box::new(replacer::LRU::new(pool_size)),
        })
    }

    /// Wires in the log manager that guards dirty write-backs (WAL rule).
    pub fn attach_log_manager(&mut self, log_manager: Arc<LogManager>) {
        self.log_manager = Some(log_manager);
    }

    pub fn disk_manager(&self) -> &DiskManager {
        &self.disk_manager
    }

    /// Pins and returns the frame holding `page_id`, reading it from disk
    /// through a free or evicted frame when it is not resident. Fails with
    /// [`Error::PoolExhausted`] when every frame is pinned.
    pub fn fetch_page(&mut self, page_id: PageId) -> Result<&mut Frame> {
        ensure!(page_id != INVALID_PAGE_ID, Error::InvalidPage(page_id));

        if let Some(frame_id) = self.page_table.find(&page_id) {
            if self.frames[frame_id].pin_count() == 0 {
                self.replacer.erase(frame_id);
            }
            let frame = &mut self.frames[frame_id];
            frame.pin();
            return Ok(frame);
        }

        let frame_id = self.find_victim()?;
        let page = self.disk_manager.read_page(page_id)?;

        let frame = &mut self.frames[frame_id];
        frame.set_page(page);
        frame.pin();
        self.page_table.insert(page_id, frame_id);

        debug!("fetched page {page_id} into frame {frame_id}");
        Ok(&mut self.frames[frame_id])
    }

    /// Allocates a fresh page id and pins a zeroed frame for it. The new
    /// page starts dirty so it reaches disk even if never written again.
    pub fn new_page(&mut self) -> Result<&mut Frame> {
        let frame_id = self.find_victim()?;
        let page_id = self.disk_manager.allocate_page();

        let mut page = Page::new();
        page.set_page_id(page_id);
        page.mark_dirty();

        let frame = &mut self.frames[frame_id];
        frame.set_page(page);
        frame.pin();
        self.page_table.insert(page_id, frame_id);

        debug!("created page {page_id} in frame {frame_id}");
        Ok(&mut self.frames[frame_id])
    }

    /// Prefer the free list; otherwise evict the replacer's victim, writing
    /// it back first when dirty. The log is forced up to the victim's lsn
    /// before the write (WAL).
    fn find_victim(&mut self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_frames.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = self.replacer.victim() else {
            bail!(Error::PoolExhausted);
        };

        let frame = &self.frames[frame_id];
        assert_eq!(frame.pin_count(), 0);
        let page = frame.reader();
        let old_page_id = page.get_page_id();
        self.page_table.remove(&old_page_id);

        if page.is_dirty() {
            self.flush_log_for(page.lsn())?;
            self.disk_manager.write_page(page)?;
            debug!("evicted dirty page {old_page_id} from frame {frame_id}");
        }
        self.frames[frame_id].writer().mark_clean();

        Ok(frame_id)
    }

    fn flush_log_for(&self, page_lsn: crate::pages::Lsn) -> Result<()> {
        if let Some(log_manager) = &self.log_manager {
            if page_lsn > log_manager.persistent_lsn() {
                log_manager.flush_up_to(page_lsn)?;
            }
        }
        Ok(())
    }

    /// Drops one pin. `is_dirty` is OR-ed into the page's dirty flag, a
    /// clean unpin never clears what an earlier writer set.
    pub fn unpin_page(&mut self, page_id: PageId, is_dirty: bool) -> bool {
        let Some(frame_id) = self.page_table.find(&page_id) else {
            warn!("unpin of page {page_id} which is not resident");
            return false;
        };

        let frame = &mut self.frames[frame_id];
        if frame.pin_count() == 0 {
            warn!("unpin of page {page_id} with pin count 0");
            return false;
        }

        if is_dirty {
            frame.writer().mark_dirty();
        }
        frame.unpin();
        if frame.pin_count() == 0 {
            self.replacer.insert(frame_id);
        }
        true
    }

    /// Write-through of a resident page. The dirty flag is left alone, the
    /// caller decides whether further mutation happened.
    pub fn flush_page(&mut self, page_id: PageId) -> Result<bool> {
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(false);
        };

        let page = self.frames[frame_id].reader();
        self.flush_log_for(page.lsn())?;
        self.disk_manager.write_page(page)?;
        Ok(true)
    }

    pub fn flush_all(&mut self) -> Result<()> {
        let page_ids = self
            .frames
            .iter()
            .filter(|frame| frame.reader().get_page_id() != INVALID_PAGE_ID)
            .filter(|frame| frame.reader().is_dirty())
            .map(|frame| frame.reader().get_page_id())
            .collect::<Vec<_>>();

        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Returns the frame to the free list and deallocates on disk. Fails
    /// (returns `false`) when the page is pinned.
    pub fn delete_page(&mut self, page_id: PageId) -> Result<bool> {
        let Some(frame_id) = self.page_table.find(&page_id) else {
            self.disk_manager.deallocate_page(page_id);
            return Ok(true);
        };

        if self.frames[frame_id].pin_count() != 0 {
            return Ok(false);
        }

        self.page_table.remove(&page_id);
        self.replacer.erase(frame_id);
        self.frames[frame_id].reset();
        self.free_frames.push_back(frame_id);
        self.disk_manager.deallocate_page(page_id);
        debug!("deleted page {page_id}, frame {frame_id} freed");
        Ok(true)
    }

    /// Number of frames currently holding a pin, the invariant checks of the
    /// index tests expect this to drop back to zero after every operation.
    pub fn pinned_count(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| frame.pin_count() > 0)
            .count()
    }

    #[cfg(test)]
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let frame_id = self.page_table.find(&page_id)?;
        Some(self.frames[frame_id].pin_count())
    }
}

lazy_static! {
    static ref BUFFER_POOL: ArcBufferPool = Arc::new(FairMutex::new(
        BufferPoolManager::new(BUFFER_POOL_SIZE, DISK_STORAGE)
            .expect("failed to open the default buffer pool")
    ));
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::disk_manager::test_path;

    fn test_bpm(size: usize, path: &str) -> BufferPoolManager {
        BufferPoolManager::new(size, path).unwrap()
    }

    pub fn test_arc_bpm(size: usize) -> ArcBufferPool {
        Arc::new(FairMutex::new(test_bpm(size, &test_path())))
    }

    #[test]
    fn test_dont_evict_pinned() -> Result<()> {
        let path = test_path();
        let mut bpm = test_bpm(2, &path);

        let p1 = bpm.new_page()?.reader().get_page_id();
        let p2 = bpm.new_page()?.reader().get_page_id();

        assert!(bpm.new_page().is_err());

        bpm.unpin_page(p1, false);
        assert!(bpm.new_page().is_ok());

        // p1 was evicted for the new page above
        bpm.unpin_page(p2, false);
        let _ = bpm.fetch_page(p1)?;
        assert!(bpm.new_page().is_err());

        bpm.unpin_page(p1, false);
        Ok(())
    }

    #[test]
    fn test_eviction_is_least_recently_unpinned() -> Result<()> {
        let path = test_path();
        let mut bpm = test_bpm(3, &path);

        let p1 = bpm.new_page()?.reader().get_page_id();
        let p2 = bpm.new_page()?.reader().get_page_id();
        let p3 = bpm.new_page()?.reader().get_page_id();

        bpm.unpin_page(p2, false);
        bpm.unpin_page(p1, false);
        bpm.unpin_page(p3, false);

        // p2 is the oldest unpinned page, so the next new page takes its frame
        let _p4 = bpm.new_page()?.reader().get_page_id();
        assert!(bpm.get_pin_count(p2).is_none());
        assert!(bpm.get_pin_count(p1).is_some());
        assert!(bpm.get_pin_count(p3).is_some());
        Ok(())
    }

    #[test]
    fn test_dirty_page_survives_eviction() -> Result<()> {
        let path = test_path();
        let mut bpm = test_bpm(2, &path);

        let p1 = {
            let frame = bpm.new_page()?;
            let page = frame.writer();
            page.write_bytes(100, 104, &[9, 9, 9, 9]);
            page.get_page_id()
        };
        bpm.unpin_page(p1, true);

        // force p1 out of the pool
        let p2 = bpm.new_page()?.reader().get_page_id();
        let p3 = bpm.new_page()?.reader().get_page_id();
        bpm.unpin_page(p2, false);
        bpm.unpin_page(p3, false);

        let frame = bpm.fetch_page(p1)?;
        assert_eq!(frame.reader().read_bytes(100, 104), &[9, 9, 9, 9]);
        bpm.unpin_page(p1, false);
        Ok(())
    }

    #[test]
    fn test_unpin_dirty_flag_is_sticky() -> Result<()> {
        let path = test_path();
        let mut bpm = test_bpm(2, &path);

        let p1 = {
            let frame = bpm.new_page()?;
            frame.writer().write_bytes(0, 4, &[1, 2, 3, 4]);
            frame.reader().get_page_id()
        };
        bpm.unpin_page(p1, true);

        // a clean unpin must not clear the dirty flag set above
        let _ = bpm.fetch_page(p1)?;
        bpm.unpin_page(p1, false);

        let frame_id = bpm.page_table.find(&p1).unwrap();
        assert!(bpm.frames[frame_id].reader().is_dirty());
        Ok(())
    }

    #[test]
    fn test_unpin_underflow_rejected() -> Result<()> {
        let path = test_path();
        let mut bpm = test_bpm(2, &path);

        let p1 = bpm.new_page()?.reader().get_page_id();
        assert!(bpm.unpin_page(p1, false));
        assert!(!bpm.unpin_page(p1, false));
        assert!(!bpm.unpin_page(999, false));
        Ok(())
    }

    #[test]
    fn test_delete_page() -> Result<()> {
        let path = test_path();
        let mut bpm = test_bpm(2, &path);

        let p1 = bpm.new_page()?.reader().get_page_id();

        // pinned pages cannot be deleted
        assert!(!bpm.delete_page(p1)?);
        bpm.unpin_page(p1, false);
        assert!(bpm.delete_page(p1)?);

        // unknown pages only hit the disk manager
        assert!(bpm.delete_page(424_242)?);

        // the freed frame is reusable
        let _ = bpm.new_page()?;
        let _ = bpm.new_page()?;
        assert!(bpm.new_page().is_err());
        Ok(())
    }

    #[test]
    fn test_pinned_count_accounting() -> Result<()> {
        let path = test_path();
        let mut bpm = test_bpm(4, &path);

        let p1 = bpm.new_page()?.reader().get_page_id();
        let p2 = bpm.new_page()?.reader().get_page_id();
        assert_eq!(bpm.pinned_count(), 2);

        let _ = bpm.fetch_page(p1)?;
        assert_eq!(bpm.pinned_count(), 2);
        assert_eq!(bpm.get_pin_count(p1), Some(2));

        bpm.unpin_page(p1, false);
        bpm.unpin_page(p1, false);
        bpm.unpin_page(p2, false);
        assert_eq!(bpm.pinned_count(), 0);
        Ok(())
    }
}
