mod latch;
pub(crate) mod header_page;
pub(crate) mod traits;

pub mod indexes;

pub use latch::Latch;
use traits::Serialize;

pub const PAGE_SIZE: usize = 4096; // 4 KBs
pub const INVALID_PAGE_ID: PageId = -1;
/// page 0 holds the index-name -> root-id record table
pub const HEADER_PAGE_ID: PageId = 0;

pub type PageId = i32;

pub type Lsn = i32;
pub const INVALID_LSN: Lsn = -1;

/// byte offset of the lsn field inside every managed page header
const LSN_OFFSET: usize = 4;

/// A generic page with an underlying array of [`PAGE_SIZE`] bytes.
/// Typed views (header page, tree pages) are computed over the bytes.
#[repr(C, align(4))]
#[derive(Debug)]
pub struct Page {
    /// Underlying block of memory of size [`PAGE_SIZE`]
    data: [u8; PAGE_SIZE],
    is_dirty: bool,
    page_id: PageId,
    lsn: Lsn,
}

impl Serialize for Page {
    fn to_bytes(&self) -> &[u8] {
        &self.data
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), PAGE_SIZE);
        let mut page = Page::new();
        page.data.copy_from_slice(bytes);
        page.lsn = page.read_i32(LSN_OFFSET);
        page
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::new()
    }
}

impl Page {
    pub fn new() -> Self {
        Page {
            data: [0u8; PAGE_SIZE],
            is_dirty: false,
            page_id: INVALID_PAGE_ID,
            lsn: INVALID_LSN,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    pub fn get_page_id(&self) -> PageId {
        self.page_id
    }

    pub fn set_page_id(&mut self, page_id: PageId) {
        self.page_id = page_id;
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// records the lsn of the latest change, both in memory and in the
    /// persisted header bytes
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.lsn = lsn;
        self.write_i32(LSN_OFFSET, lsn);
    }

    pub fn read_bytes(&self, start: usize, end: usize) -> &[u8] {
        &self.data[start..end]
    }

    pub fn write_bytes(&mut self, start: usize, end: usize, bytes: &[u8]) {
        self.data[start..end].copy_from_slice(bytes);
        self.is_dirty = true;
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.write_bytes(offset, offset + 4, &value.to_le_bytes());
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, offset + 4, &value.to_le_bytes());
    }

    /// raw mutable access for in-place entry shifts, marks the page dirty
    pub(crate) fn buf_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.is_dirty = true;
        &mut self.data
    }
}
