// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! One process's virtual address space.
//!
//! Layout, low to high: image pages (read-only portion first), stack
//! pages, one argument page. Pages start unmapped and are materialized
//! on first fault: image pages from the program image, everything else
//! zero-filled.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::page_table::PageTable;
use super::{PageFlags, PAGE_SIZE};
use crate::loader::ProgramImage;
use crate::types::VirtPage;

/// What a fresh (unmapped) page is materialized from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOrigin {
    /// Initial bytes come from the program image.
    Image,
    /// Zero fill (stack and argument pages).
    Zero,
}

/// Address space: page table plus the segment layout needed to classify
/// faults and refill discarded pages.
pub struct AddressSpace {
    image: Arc<ProgramImage>,
    image_pages: usize,
    num_pages: usize,
    table: Mutex<PageTable>,
}

impl AddressSpace {
    pub fn new(image: Arc<ProgramImage>, stack_pages: usize) -> Self {
        let image_pages = image.total_pages();
        let num_pages = image_pages + stack_pages + 1;
        let mut table = PageTable::new(num_pages);
        for index in 0..image.read_only_pages() {
            table.set_flags(VirtPage::from_raw(index as u32), PageFlags::READ_ONLY);
        }
        Self { image, image_pages, num_pages, table: Mutex::new(table) }
    }

    /// Total pages covered (image + stack + argument page).
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Total bytes addressable in this space.
    pub fn size_bytes(&self) -> usize {
        self.num_pages * PAGE_SIZE
    }

    /// The argument page sits at the very top of the space.
    pub fn args_page(&self) -> VirtPage {
        VirtPage::from_raw((self.num_pages - 1) as u32)
    }

    /// First byte address of the stack region (also: end of the image).
    pub fn stack_base(&self) -> usize {
        self.image_pages * PAGE_SIZE
    }

    /// Locks the page table.
    pub fn table(&self) -> MutexGuard<'_, PageTable> {
        self.table.lock()
    }

    /// Classifies `vpn`, or `None` outside the space.
    pub fn page_origin(&self, vpn: VirtPage) -> Option<PageOrigin> {
        if vpn.as_index() >= self.num_pages {
            None
        } else if vpn.as_index() < self.image_pages {
            Some(PageOrigin::Image)
        } else {
            Some(PageOrigin::Zero)
        }
    }

    /// Writes the initial content of `vpn` into `out` (a full page).
    pub fn fill_initial(&self, vpn: VirtPage, out: &mut [u8]) {
        out.fill(0);
        if self.page_origin(vpn) == Some(PageOrigin::Image) {
            self.image.fill_page(vpn.as_index(), out);
        }
    }
}
