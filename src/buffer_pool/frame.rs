use std::sync::Arc;

use crate::pages::{Latch, Page};

/// A buffer pool slot. The latch belongs to the frame, not the page id, so
/// latch identity is stable across page rebinds.
#[derive(Debug)]
pub struct Frame {
    page: Page,
    pin_count: u32,
    latch: Arc<Latch>,
}

impl Frame {
    pub(super) fn new() -> Self {
        Self {
            page: Page::new(),
            pin_count: 0,
            latch: Arc::new(Latch::new()),
        }
    }

    pub(super) fn pin(&mut self) {
        self.pin_count += 1;
    }

    pub(super) fn unpin(&mut self) {
        debug_assert!(self.pin_count > 0);
        self.pin_count -= 1;
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    pub(super) fn set_page(&mut self, page: Page) {
        debug_assert_eq!(self.pin_count, 0);
        self.page = page;
    }

    pub(super) fn reset(&mut self) {
        self.page = Page::new();
        self.pin_count = 0;
    }

    pub fn reader(&self) -> &Page {
        &self.page
    }

    pub fn writer(&mut self) -> &mut Page {
        &mut self.page
    }

    pub fn latch(&self) -> &Arc<Latch> {
        &self.latch
    }
}
