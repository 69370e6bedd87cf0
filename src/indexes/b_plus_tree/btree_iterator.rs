use log::warn;

use crate::buffer_pool::ArcBufferPool;
use crate::pages::indexes::b_plus_tree::{IndexKey, TreePage};
use crate::pages::INVALID_PAGE_ID;
use crate::tuple::Rid;

/// Leaf-chain iterator. Owns a pin on its current leaf; hopping to the next
/// leaf hands the pin over to it.
pub struct TreeIterator<K: IndexKey> {
    page: Option<TreePage<K>>,
    index: usize,
    bpm: ArcBufferPool,
}

impl<K: IndexKey> TreeIterator<K> {
    /// `page` is already pinned by the caller
    pub(super) fn new(page: TreePage<K>, index: usize, bpm: ArcBufferPool) -> Self {
        Self {
            page: Some(page),
            index,
            bpm,
        }
    }

    pub(super) fn empty(bpm: ArcBufferPool) -> Self {
        Self {
            page: None,
            index: 0,
            bpm,
        }
    }

    pub fn is_end(&self) -> bool {
        match &self.page {
            None => true,
            Some(page) => self.index >= page.size() && page.next_page_id() == INVALID_PAGE_ID,
        }
    }
}

impl<K: IndexKey> Iterator for TreeIterator<K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let page = self.page.as_ref()?;
            if self.index < page.size() {
                let item = page.item(self.index);
                self.index += 1;
                return Some(item);
            }

            let next = page.next_page_id();
            let page_id = page.page_id();
            let mut pool = self.bpm.lock();
            pool.unpin_page(page_id, false);
            if next == INVALID_PAGE_ID {
                self.page = None;
                return None;
            }
            match pool.fetch_page(next) {
                Ok(frame) => {
                    self.page = Some(TreePage::from(frame));
                    self.index = 0;
                }
                Err(e) => {
                    warn!("iterator lost the leaf chain: {e}");
                    self.page = None;
                    return None;
                }
            }
        }
    }
}

impl<K: IndexKey> Drop for TreeIterator<K> {
    fn drop(&mut self) {
        if let Some(page) = &self.page {
            self.bpm.lock().unpin_page(page.page_id(), false);
        }
    }
}
