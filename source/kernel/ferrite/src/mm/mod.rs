// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Demand-paged virtual memory: frames, swap, page tables, fault handling.

pub mod address_space;
pub mod fault;
pub mod frame;
pub mod page_table;
pub mod swap;

use bitflags::bitflags;

/// Size of a page (and of a frame, and of a swap slot) in bytes.
pub const PAGE_SIZE: usize = 4096;

bitflags! {
    /// Static per-page attributes kept in the page table.
    ///
    /// Residency bits (referenced/dirty) are *not* here: while a page is
    /// resident they live on its frame slot so the global eviction scan
    /// can read them under the narrow per-frame lock.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Page belongs to the program image's read-only portion.
        const READ_ONLY = 1 << 0;
    }
}
