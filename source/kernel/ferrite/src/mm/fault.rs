// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page fault resolution and global page replacement
//! PUBLIC API: MemoryManager (read_bytes/write_bytes/handle_fault/release_space), FaultError
//! DEPENDS_ON: frame::{FrameAllocator,FrameTable}, swap::SwapStore, address_space::AddressSpace
//! INVARIANTS: No table/allocator lock held across swap I/O; in-flight frames are pinned;
//!             a victim's PTE is downgraded before its frame is handed to the new owner.

use std::sync::Arc;

use log::{debug, trace};
use thiserror::Error;

use super::address_space::AddressSpace;
use super::frame::{FrameAllocator, FrameOwner, FrameSlot, FrameTable};
use super::page_table::PageState;
use super::swap::SwapStore;
use super::{PageFlags, PAGE_SIZE};
use crate::config::KernelConfig;
use crate::types::{FrameId, Pid, SlotId, VirtPage};

/// Process-fatal outcomes of a memory access.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Access outside every valid segment, or a write to a read-only
    /// page. Terminates only the offending process.
    #[error("invalid memory access")]
    InvalidAccess,
    /// No free frame and no evictable victim, or the swap store gave up.
    /// Terminates the faulting process, never the kernel.
    #[error("out of memory")]
    OutOfMemory,
}

/// What the missing page is filled from.
enum Fill {
    Fresh,
    Swap(SlotId),
}

/// The machine's memory: frame pool, frame table and swap store, plus
/// the fault state machine that ties them to per-process page tables.
pub struct MemoryManager {
    allocator: FrameAllocator,
    frames: FrameTable,
    swap: SwapStore,
}

impl MemoryManager {
    pub fn new(config: &KernelConfig) -> std::io::Result<Self> {
        Ok(Self {
            allocator: FrameAllocator::new(config.num_frames),
            frames: FrameTable::new(config.num_frames),
            swap: SwapStore::create(config.swap_path.clone(), config.swap_io_retries)?,
        })
    }

    /// Copies `buf.len()` bytes out of `space` starting at `vaddr`,
    /// faulting pages in as needed. Out-of-range access is a trap, not a
    /// short read.
    pub fn read_bytes(
        &self,
        space: &Arc<AddressSpace>,
        pid: Pid,
        vaddr: usize,
        buf: &mut [u8],
    ) -> Result<(), FaultError> {
        self.check_range(space, vaddr, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let addr = vaddr + done;
            let vpn = VirtPage::containing(addr);
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            self.with_resident_page(space, pid, vpn, false, |slot| {
                buf[done..done + chunk].copy_from_slice(&slot.data()[offset..offset + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies `data` into `space` starting at `vaddr`, faulting pages in
    /// as needed and dirtying them.
    pub fn write_bytes(
        &self,
        space: &Arc<AddressSpace>,
        pid: Pid,
        vaddr: usize,
        data: &[u8],
    ) -> Result<(), FaultError> {
        self.check_range(space, vaddr, data.len())?;
        let mut done = 0;
        while done < data.len() {
            let addr = vaddr + done;
            let vpn = VirtPage::containing(addr);
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            self.with_resident_page(space, pid, vpn, true, |slot| {
                slot.data_mut()[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    fn check_range(
        &self,
        space: &Arc<AddressSpace>,
        vaddr: usize,
        len: usize,
    ) -> Result<(), FaultError> {
        let end = vaddr.checked_add(len).ok_or(FaultError::InvalidAccess)?;
        if end > space.size_bytes() {
            return Err(FaultError::InvalidAccess);
        }
        Ok(())
    }

    /// Runs `access` against the resident frame of `vpn`, faulting the
    /// page in first if necessary. Referenced/dirty bits are recorded
    /// here; this is the hardware-trap path the eviction scan reads.
    fn with_resident_page<R>(
        &self,
        space: &Arc<AddressSpace>,
        pid: Pid,
        vpn: VirtPage,
        write: bool,
        access: impl FnOnce(&mut FrameSlot) -> R,
    ) -> Result<R, FaultError> {
        let mut access = Some(access);
        loop {
            {
                let table = space.table();
                let flags = table.flags(vpn).ok_or(FaultError::InvalidAccess)?;
                if write && flags.contains(PageFlags::READ_ONLY) {
                    return Err(FaultError::InvalidAccess);
                }
                if let Some(PageState::Resident(frame)) = table.translate(vpn) {
                    let mut slot = self.frames.slot(frame);
                    if !slot.is_pinned() {
                        slot.referenced = true;
                        if write {
                            slot.dirty = true;
                        }
                        let access = access.take().expect("access runs once");
                        return Ok(access(&mut slot));
                    }
                    // Pinned: an eviction or fill is in flight. Retry
                    // once the transition has committed.
                }
            }
            match space.table().translate(vpn) {
                Some(PageState::Resident(_)) => std::thread::yield_now(),
                _ => self.handle_fault(space, pid, vpn)?,
            }
        }
    }

    /// Resolves a fault on `vpn`: classify, obtain and fill a frame,
    /// commit the mapping. Returns once the page is resident (or was
    /// already resident after a race).
    pub fn handle_fault(
        &self,
        space: &Arc<AddressSpace>,
        pid: Pid,
        vpn: VirtPage,
    ) -> Result<(), FaultError> {
        let fill = {
            let table = space.table();
            match table.translate(vpn) {
                None => return Err(FaultError::InvalidAccess),
                Some(PageState::Resident(_)) => return Ok(()),
                Some(PageState::Swapped(slot)) => Fill::Swap(slot),
                Some(PageState::Unmapped) => Fill::Fresh,
            }
        };
        trace!(target: "mm", "fault pid={pid} vpn={vpn}");

        // The frame comes back pinned and unowned; the pin keeps the
        // eviction scan away until the mapping commits.
        let frame = self.acquire_frame()?;

        let from_swap = match &fill {
            Fill::Fresh => {
                let mut slot = self.frames.slot(frame);
                space.fill_initial(vpn, slot.data_mut());
                false
            }
            Fill::Swap(swap_slot) => {
                let mut page = vec![0u8; PAGE_SIZE];
                if let Err(err) = self.swap.read_in(*swap_slot, &mut page) {
                    debug!(target: "mm", "swap-in failed pid={pid} vpn={vpn}: {err}");
                    self.abandon_frame(frame);
                    return Err(FaultError::OutOfMemory);
                }
                self.frames.slot(frame).data_mut().copy_from_slice(&page);
                true
            }
        };

        // Commit: PTE first, then the frame's owner record, then release
        // the swap slot, so the page is never without a backing copy.
        {
            let mut table = space.table();
            match (&fill, table.translate(vpn)) {
                (Fill::Fresh, Some(PageState::Unmapped))
                | (Fill::Swap(_), Some(PageState::Swapped(_))) => {}
                (_, state) => {
                    unreachable!("fault commit: pte of {pid}/{vpn} changed underneath: {state:?}")
                }
            }
            table.map(vpn, frame);
            let mut slot = self.frames.slot(frame);
            slot.owner = Some(FrameOwner { pid, vpn, space: Arc::clone(space) });
            // A page restored from swap is the only copy of its data
            // (the slot is released below), so it must leave as dirty.
            slot.dirty = from_swap;
            slot.referenced = true;
            slot.pin_count = 0;
        }
        if let Fill::Swap(swap_slot) = fill {
            self.swap.release(swap_slot);
        }
        trace!(target: "mm", "mapped pid={pid} vpn={vpn} -> frame {frame}");
        Ok(())
    }

    /// Allocates a frame, evicting a victim when the pool is dry.
    fn acquire_frame(&self) -> Result<FrameId, FaultError> {
        if let Some(frame) = self.allocator.allocate() {
            let mut slot = self.frames.slot(frame);
            debug_assert!(slot.owner.is_none(), "free-listed frame {frame} has an owner");
            slot.pin_count = 1;
            return Ok(frame);
        }
        self.evict_one()
    }

    /// Returns a frame obtained mid-fault back to the free pool.
    fn abandon_frame(&self, frame: FrameId) {
        {
            let mut slot = self.frames.slot(frame);
            slot.pin_count = 0;
            slot.dirty = false;
            slot.referenced = false;
        }
        self.allocator.free(frame);
    }

    /// Global clock/second-chance eviction across all resident pages.
    ///
    /// The chosen victim is pinned before anything else happens; user
    /// accesses back off from pinned frames, so the frame's content is
    /// stable from that point. The dirty copy is written out with no
    /// table lock held, and the victim's PTE is downgraded before the
    /// frame is handed to the caller.
    fn evict_one(&self) -> Result<FrameId, FaultError> {
        let max_steps = 3 * self.frames.len();
        for _ in 0..max_steps {
            let frame = self.frames.clock_next();
            let claimed = {
                let mut slot = self.frames.slot(frame);
                if slot.is_pinned() || slot.owner.is_none() {
                    None
                } else if slot.referenced {
                    slot.referenced = false;
                    None
                } else {
                    slot.pin_count = 1;
                    let owner = slot.owner.as_ref().expect("claimed frame has owner");
                    let data = slot.dirty.then(|| slot.data().to_vec());
                    Some((owner.pid, owner.vpn, Arc::clone(&owner.space), data))
                }
            };
            let Some((victim_pid, victim_vpn, victim_space, dirty_copy)) = claimed else {
                continue;
            };

            let swap_slot = match dirty_copy {
                Some(data) => match self.swap.write_out(victim_pid, victim_vpn, &data) {
                    Ok(slot) => Some(slot),
                    Err(err) => {
                        debug!(target: "mm", "evict write-out failed: {err}");
                        self.frames.slot(frame).pin_count = 0;
                        return Err(FaultError::OutOfMemory);
                    }
                },
                // Clean and re-creatable from zero fill or the image.
                None => None,
            };

            {
                let mut table = victim_space.table();
                match table.translate(victim_vpn) {
                    Some(PageState::Resident(resident)) if resident == frame => match swap_slot {
                        Some(slot) => table.mark_swapped(victim_vpn, slot),
                        None => table.unmap(victim_vpn),
                    },
                    state => {
                        unreachable!(
                            "evict: pte of {victim_pid}/{victim_vpn} changed while pinned: {state:?}"
                        )
                    }
                }
                let mut slot = self.frames.slot(frame);
                slot.owner = None;
                slot.dirty = false;
                slot.referenced = false;
                // The pin survives: the frame now belongs to the caller.
            }
            debug!(
                target: "mm",
                "evicted pid={victim_pid} vpn={victim_vpn} frame={frame} swapped={}",
                swap_slot.is_some()
            );
            return Ok(frame);
        }
        debug!(target: "mm", "no evictable frame after {max_steps} clock steps");
        Err(FaultError::OutOfMemory)
    }

    /// Releases every frame and swap slot of `space`. Called on process
    /// exit, before the PCB becomes reapable.
    pub fn release_space(&self, pid: Pid, space: &Arc<AddressSpace>) {
        let pages: Vec<VirtPage> = space.table().iter().map(|(vpn, _)| vpn).collect();
        for vpn in pages {
            loop {
                let mut table = space.table();
                match table.translate(vpn).expect("release: vpn within table") {
                    PageState::Resident(frame) => {
                        let mut slot = self.frames.slot(frame);
                        if slot.is_pinned() {
                            // An eviction is mid-flight on this frame;
                            // once it commits the PTE reads Swapped.
                            drop(slot);
                            drop(table);
                            std::thread::yield_now();
                            continue;
                        }
                        debug_assert_eq!(slot.owner_key(), Some((pid, vpn)));
                        slot.owner = None;
                        slot.dirty = false;
                        slot.referenced = false;
                        table.unmap(vpn);
                        drop(slot);
                        drop(table);
                        self.allocator.free(frame);
                    }
                    PageState::Swapped(swap_slot) => {
                        table.unmap(vpn);
                        drop(table);
                        self.swap.release(swap_slot);
                    }
                    PageState::Unmapped => {}
                }
                break;
            }
        }
        debug!(target: "mm", "released address space of pid={pid}");
    }

    pub fn total_frames(&self) -> usize {
        self.allocator.total()
    }

    pub fn free_frames(&self) -> usize {
        self.allocator.free_count()
    }

    pub fn owned_frames(&self) -> usize {
        self.frames.owned_count()
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.slots_in_use()
    }
}
