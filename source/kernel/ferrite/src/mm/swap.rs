// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Swap backing store: one growable file of page-sized slots.
//!
//! Slot allocation reuses freed slots before extending the file, keeping
//! the backing store compact. Reading or releasing a slot that is not
//! occupied is a bookkeeping violation and fatal: it means the page
//! tables and the slot table disagree, and nothing downstream can be
//! trusted.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use super::PAGE_SIZE;
use crate::types::{Pid, SlotId, VirtPage};

/// Errors surfaced by the swap store after retries are exhausted.
/// Callers treat these as resource exhaustion for the faulting process,
/// never as a kernel failure.
#[derive(Debug, Error)]
pub enum SwapError {
    /// Device-level I/O failure that persisted across retries.
    #[error("swap i/o failed after {attempts} attempts: {source}")]
    Io {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

struct SlotTable {
    /// Owner of each slot ever created; `None` = free for reuse.
    occupied: Vec<Option<(Pid, VirtPage)>>,
    free: Vec<SlotId>,
}

/// File-backed store for evicted pages.
pub struct SwapStore {
    file: Mutex<File>,
    slots: Mutex<SlotTable>,
    path: PathBuf,
    io_retries: u32,
}

impl SwapStore {
    /// Creates (truncating any stale file) the backing store at `path`.
    pub fn create(path: impl Into<PathBuf>, io_retries: u32) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(target: "swap", "backing store at {}", path.display());
        Ok(Self {
            file: Mutex::new(file),
            slots: Mutex::new(SlotTable { occupied: Vec::new(), free: Vec::new() }),
            path,
            io_retries,
        })
    }

    /// Writes one page out and returns the slot holding it.
    pub fn write_out(&self, pid: Pid, vpn: VirtPage, data: &[u8]) -> Result<SlotId, SwapError> {
        assert_eq!(data.len(), PAGE_SIZE, "swap: short page write");
        let slot = {
            let mut slots = self.slots.lock();
            match slots.free.pop() {
                Some(slot) => {
                    slots.occupied[slot.as_index()] = Some((pid, vpn));
                    slot
                }
                None => {
                    let slot = SlotId::from_raw(slots.occupied.len() as u32);
                    slots.occupied.push(Some((pid, vpn)));
                    slot
                }
            }
        };
        match self.retry_io(|file| {
            file.seek(SeekFrom::Start(slot.file_offset()))?;
            file.write_all(data)
        }) {
            Ok(()) => {
                debug!(target: "swap", "out pid={pid} vpn={vpn} -> slot {slot}");
                Ok(slot)
            }
            Err(err) => {
                // The slot never became visible to any page table.
                self.release(slot);
                Err(err)
            }
        }
    }

    /// Reads the page stored in `slot` into `data`. The slot stays
    /// occupied; callers `release` it once the page is resident again.
    pub fn read_in(&self, slot: SlotId, data: &mut [u8]) -> Result<(), SwapError> {
        assert_eq!(data.len(), PAGE_SIZE, "swap: short page read");
        {
            let slots = self.slots.lock();
            assert!(
                slots.occupied.get(slot.as_index()).is_some_and(Option::is_some),
                "swap: read of unoccupied slot {slot}"
            );
        }
        self.retry_io(|file| {
            file.seek(SeekFrom::Start(slot.file_offset()))?;
            file.read_exact(data)
        })?;
        debug!(target: "swap", "in slot {slot}");
        Ok(())
    }

    /// Frees `slot` for reuse. Releasing an already-free slot is fatal.
    pub fn release(&self, slot: SlotId) {
        let mut slots = self.slots.lock();
        let entry = slots
            .occupied
            .get_mut(slot.as_index())
            .unwrap_or_else(|| panic!("swap: release of unknown slot {slot}"));
        assert!(entry.is_some(), "swap: double release of slot {slot}");
        *entry = None;
        slots.free.push(slot);
    }

    /// Slots currently holding a page.
    pub fn slots_in_use(&self) -> usize {
        let slots = self.slots.lock();
        slots.occupied.iter().filter(|entry| entry.is_some()).count()
    }

    fn retry_io(
        &self,
        mut op: impl FnMut(&mut File) -> std::io::Result<()>,
    ) -> Result<(), SwapError> {
        let mut file = self.file.lock();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op(&mut file) {
                Ok(()) => return Ok(()),
                Err(source) if attempts > self.io_retries => {
                    return Err(SwapError::Io { attempts, source });
                }
                Err(err) => {
                    warn!(target: "swap", "i/o retry {attempts}: {err}");
                }
            }
        }
    }
}

impl Drop for SwapStore {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(target: "swap", "failed to remove {}: {err}", self.path.display());
        }
    }
}
