// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-address-space page table.
//!
//! Each entry is in exactly one of three states: resident in a physical
//! frame, parked in a swap slot, or unmapped (never materialized, or
//! discarded because it is re-creatable from zero fill / the image).

use super::PageFlags;
use crate::types::{FrameId, SlotId, VirtPage};

/// Residency state of one virtual page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Backed by a physical frame.
    Resident(FrameId),
    /// Evicted; current content lives in the swap store.
    Swapped(SlotId),
    /// No backing; a fault materializes it from zero fill or the image.
    Unmapped,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    state: PageState,
    flags: PageFlags,
}

/// Page table for one address space.
///
/// The table itself is not synchronized; the owning `AddressSpace` wraps
/// it in its own lock.
#[derive(Debug)]
pub struct PageTable {
    entries: Vec<Entry>,
}

impl PageTable {
    /// Creates a table of `num_pages` unmapped entries.
    pub fn new(num_pages: usize) -> Self {
        let entries =
            vec![Entry { state: PageState::Unmapped, flags: PageFlags::empty() }; num_pages];
        Self { entries }
    }

    /// Number of pages covered by this table.
    pub fn num_pages(&self) -> usize {
        self.entries.len()
    }

    /// Returns the residency state of `vpn`, or `None` outside the table.
    pub fn translate(&self, vpn: VirtPage) -> Option<PageState> {
        self.entries.get(vpn.as_index()).map(|entry| entry.state)
    }

    /// Returns the static flags of `vpn`, or `None` outside the table.
    pub fn flags(&self, vpn: VirtPage) -> Option<PageFlags> {
        self.entries.get(vpn.as_index()).map(|entry| entry.flags)
    }

    /// Sets the static flags of `vpn`.
    pub fn set_flags(&mut self, vpn: VirtPage, flags: PageFlags) {
        if let Some(entry) = self.entries.get_mut(vpn.as_index()) {
            entry.flags = flags;
        }
    }

    /// Installs `vpn -> frame`. The previous state must not be resident:
    /// a double map would leak a frame, which indicates corrupted fault
    /// bookkeeping.
    pub fn map(&mut self, vpn: VirtPage, frame: FrameId) {
        let entry = &mut self.entries[vpn.as_index()];
        assert!(
            !matches!(entry.state, PageState::Resident(_)),
            "page table: double map of vpn {vpn}"
        );
        entry.state = PageState::Resident(frame);
    }

    /// Downgrades `vpn` from resident to swapped-out at `slot`.
    pub fn mark_swapped(&mut self, vpn: VirtPage, slot: SlotId) {
        let entry = &mut self.entries[vpn.as_index()];
        assert!(
            matches!(entry.state, PageState::Resident(_)),
            "page table: mark_swapped on non-resident vpn {vpn}"
        );
        entry.state = PageState::Swapped(slot);
    }

    /// Drops any backing for `vpn`.
    pub fn unmap(&mut self, vpn: VirtPage) {
        self.entries[vpn.as_index()].state = PageState::Unmapped;
    }

    /// Iterates over `(vpn, state)` for every entry.
    pub fn iter(&self) -> impl Iterator<Item = (VirtPage, PageState)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (VirtPage::from_raw(index as u32), entry.state))
    }
}
