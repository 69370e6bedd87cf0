use crate::pages::indexes::b_plus_tree::{TreePageType, TREE_PAGE_HEADER_SIZE};
use crate::pages::{Page, PageId, HEADER_PAGE_ID, INVALID_LSN, PAGE_SIZE};

/// max length of an index name stored in a header record
pub const RECORD_NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = RECORD_NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - TREE_PAGE_HEADER_SIZE) / RECORD_SIZE;

const SIZE_OFFSET: usize = 8;

/// View over page 0: a flat record table mapping index names to root page
/// ids. The tree updates its record on every root change.
pub struct HeaderPage<'a> {
    page: &'a mut Page,
}

impl<'a> HeaderPage<'a> {
    /// Builds the view, initializing the header fields the first time the
    /// page is seen (a fresh header page reads back as all zeroes).
    pub fn new(page: &'a mut Page) -> Self {
        let mut header = Self { page };
        if header.page.read_i32(0) != TreePageType::Header as i32 {
            header.init();
        }
        header
    }

    fn init(&mut self) {
        self.page.write_i32(0, TreePageType::Header as i32);
        self.page.set_lsn(INVALID_LSN);
        self.page.write_i32(SIZE_OFFSET, 0);
        self.page.write_i32(12, MAX_RECORDS as i32);
        self.page.write_i32(16, -1);
        self.page.write_i32(20, HEADER_PAGE_ID);
    }

    pub fn record_count(&self) -> usize {
        self.page.read_i32(SIZE_OFFSET) as usize
    }

    fn set_record_count(&mut self, count: usize) {
        self.page.write_i32(SIZE_OFFSET, count as i32);
    }

    fn record_offset(index: usize) -> usize {
        TREE_PAGE_HEADER_SIZE + index * RECORD_SIZE
    }

    fn name_at(&self, index: usize) -> &[u8] {
        let offset = Self::record_offset(index);
        self.page.read_bytes(offset, offset + RECORD_NAME_SIZE)
    }

    fn find_record(&self, name: &str) -> Option<usize> {
        let padded = Self::padded_name(name)?;
        (0..self.record_count()).find(|i| self.name_at(*i) == padded)
    }

    fn padded_name(name: &str) -> Option<[u8; RECORD_NAME_SIZE]> {
        if name.len() > RECORD_NAME_SIZE {
            return None;
        }
        let mut padded = [0u8; RECORD_NAME_SIZE];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        Some(padded)
    }

    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        let count = self.record_count();
        if count >= MAX_RECORDS || self.find_record(name).is_some() {
            return false;
        }
        let Some(padded) = Self::padded_name(name) else {
            return false;
        };

        let offset = Self::record_offset(count);
        self.page
            .write_bytes(offset, offset + RECORD_NAME_SIZE, &padded);
        self.page.write_i32(offset + RECORD_NAME_SIZE, root_page_id);
        self.set_record_count(count + 1);
        true
    }

    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match self.find_record(name) {
            Some(index) => {
                let offset = Self::record_offset(index);
                self.page.write_i32(offset + RECORD_NAME_SIZE, root_page_id);
                true
            }
            None => false,
        }
    }

    pub fn delete_record(&mut self, name: &str) -> bool {
        let Some(index) = self.find_record(name) else {
            return false;
        };
        let count = self.record_count();

        let start = Self::record_offset(index + 1);
        let end = Self::record_offset(count);
        let dest = Self::record_offset(index);
        self.page.buf_mut().copy_within(start..end, dest);
        self.set_record_count(count - 1);
        true
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        let index = self.find_record(name)?;
        let offset = Self::record_offset(index);
        Some(self.page.read_i32(offset + RECORD_NAME_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::INVALID_PAGE_ID;

    #[test]
    fn test_insert_update_get() {
        let mut page = Page::new();
        let mut header = HeaderPage::new(&mut page);

        assert!(header.insert_record("orders_pk", 3));
        assert!(header.insert_record("users_pk", 7));
        assert!(!header.insert_record("orders_pk", 5), "duplicate name");

        assert_eq!(header.get_root_id("orders_pk"), Some(3));
        assert_eq!(header.get_root_id("users_pk"), Some(7));
        assert_eq!(header.get_root_id("missing"), None);

        assert!(header.update_record("orders_pk", INVALID_PAGE_ID));
        assert_eq!(header.get_root_id("orders_pk"), Some(INVALID_PAGE_ID));
        assert!(!header.update_record("missing", 1));
    }

    #[test]
    fn test_delete_compacts_records() {
        let mut page = Page::new();
        let mut header = HeaderPage::new(&mut page);

        header.insert_record("a", 1);
        header.insert_record("b", 2);
        header.insert_record("c", 3);

        assert!(header.delete_record("b"));
        assert_eq!(header.record_count(), 2);
        assert_eq!(header.get_root_id("a"), Some(1));
        assert_eq!(header.get_root_id("c"), Some(3));
        assert!(!header.delete_record("b"));
    }

    #[test]
    fn test_survives_serialization_round_trip() {
        use crate::pages::traits::Serialize;

        let mut page = Page::new();
        let mut header = HeaderPage::new(&mut page);
        header.insert_record("idx", 42);

        let mut restored = Page::from_bytes(page.to_bytes());
        let header = HeaderPage::new(&mut restored);
        assert_eq!(header.get_root_id("idx"), Some(42));
    }

    #[test]
    fn test_name_too_long_rejected() {
        let mut page = Page::new();
        let mut header = HeaderPage::new(&mut page);
        let long_name = "x".repeat(RECORD_NAME_SIZE + 1);
        assert!(!header.insert_record(&long_name, 1));
    }
}
