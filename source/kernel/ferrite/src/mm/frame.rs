// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frame pool.
//!
//! Two structures share the frame id space. `FrameAllocator` is the
//! free-list: O(1) allocate/free behind one allocator-wide lock, with a
//! fatal check against double frees. `FrameTable` holds the per-frame
//! slots (page bytes, owner, pin count, referenced/dirty bits), each
//! behind its own narrow lock so the global eviction scan never takes a
//! process's page-table lock just to read bits.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::PAGE_SIZE;
use crate::mm::address_space::AddressSpace;
use crate::types::{FrameId, Pid, VirtPage};

/// Hands out frame ids from a free list.
pub struct FrameAllocator {
    inner: Mutex<AllocatorInner>,
    total: usize,
}

struct AllocatorInner {
    free: Vec<FrameId>,
    allocated: Vec<bool>,
}

impl FrameAllocator {
    /// Creates an allocator over `total` frames, all free.
    pub fn new(total: usize) -> Self {
        let free = (0..total as u32).rev().map(FrameId::from_raw).collect();
        Self { inner: Mutex::new(AllocatorInner { free, allocated: vec![false; total] }), total }
    }

    /// Pops a free frame, or `None` when the pool is exhausted and the
    /// caller must evict first.
    pub fn allocate(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let frame = inner.free.pop()?;
        inner.allocated[frame.as_index()] = true;
        Some(frame)
    }

    /// Returns `frame` to the pool. Freeing a frame that is not currently
    /// allocated means two owners believed they held it; kernel state is
    /// no longer trustworthy.
    pub fn free(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        assert!(
            inner.allocated[frame.as_index()],
            "frame allocator: double free of frame {frame}"
        );
        inner.allocated[frame.as_index()] = false;
        inner.free.push(frame);
    }

    /// Total number of frames managed.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of frames currently on the free list.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

/// Owner record of an allocated frame.
///
/// The address-space handle lets the evictor reach the victim's page
/// table without going through the process registry.
pub struct FrameOwner {
    pub pid: Pid,
    pub vpn: VirtPage,
    pub space: Arc<AddressSpace>,
}

/// One physical frame: its bytes plus the residency bookkeeping the
/// eviction scan needs.
pub struct FrameSlot {
    data: Box<[u8]>,
    pub(crate) owner: Option<FrameOwner>,
    pub(crate) pin_count: u32,
    pub(crate) referenced: bool,
    pub(crate) dirty: bool,
}

impl FrameSlot {
    fn new() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            owner: None,
            pin_count: 0,
            referenced: false,
            dirty: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    /// Owner pid/vpn pair, if allocated.
    pub fn owner_key(&self) -> Option<(Pid, VirtPage)> {
        self.owner.as_ref().map(|owner| (owner.pid, owner.vpn))
    }
}

/// All frame slots plus the clock hand for second-chance eviction.
pub struct FrameTable {
    slots: Vec<Mutex<FrameSlot>>,
    clock: Mutex<usize>,
}

impl FrameTable {
    pub fn new(total: usize) -> Self {
        let slots = (0..total).map(|_| Mutex::new(FrameSlot::new())).collect();
        Self { slots, clock: Mutex::new(0) }
    }

    /// Locks the slot of `frame`.
    pub fn slot(&self, frame: FrameId) -> MutexGuard<'_, FrameSlot> {
        self.slots[frame.as_index()].lock()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Advances the clock hand and returns the frame it now points at.
    pub fn clock_next(&self) -> FrameId {
        let mut hand = self.clock.lock();
        let frame = FrameId::from_raw(*hand as u32);
        *hand = (*hand + 1) % self.slots.len();
        frame
    }

    /// Number of frames currently attributed to some process. Meaningful
    /// at quiescent points only.
    pub fn owned_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.lock().owner.is_some()).count()
    }
}
