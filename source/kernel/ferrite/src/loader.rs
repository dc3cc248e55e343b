// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Program loading collaborator.
//!
//! The kernel does not parse binaries; a program is a registered body
//! (the code, run on the process's thread of control) plus a
//! `ProgramImage` describing the initial content of its image pages.
//! `exec` resolves names against the registry, which plays the role of
//! the executable store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::kernel::UserContext;
use crate::mm::PAGE_SIZE;
use crate::proc::Trap;

/// Initial content of an address space's image pages: a read-only
/// portion followed by a writable data portion, each page-rounded.
#[derive(Debug, Default)]
pub struct ProgramImage {
    read_only: Vec<u8>,
    data: Vec<u8>,
}

impl ProgramImage {
    pub fn new(read_only: Vec<u8>, data: Vec<u8>) -> Self {
        Self { read_only, data }
    }

    /// An image with no read-only portion, only writable data.
    pub fn data_only(data: Vec<u8>) -> Self {
        Self { read_only: Vec::new(), data }
    }

    /// A writable, zero-filled data region of `pages` pages.
    pub fn zeroed(pages: usize) -> Self {
        Self { read_only: Vec::new(), data: vec![0u8; pages * PAGE_SIZE] }
    }

    pub fn read_only_pages(&self) -> usize {
        self.read_only.len().div_ceil(PAGE_SIZE)
    }

    pub fn data_pages(&self) -> usize {
        self.data.len().div_ceil(PAGE_SIZE)
    }

    pub fn total_pages(&self) -> usize {
        self.read_only_pages() + self.data_pages()
    }

    /// Copies the initial bytes of image page `index` into `out`,
    /// zero-padding the tail of a partial page. `out` must already be
    /// zeroed.
    pub(crate) fn fill_page(&self, index: usize, out: &mut [u8]) {
        debug_assert_eq!(out.len(), PAGE_SIZE);
        let (region, offset) = if index < self.read_only_pages() {
            (&self.read_only, index * PAGE_SIZE)
        } else {
            (&self.data, (index - self.read_only_pages()) * PAGE_SIZE)
        };
        if offset < region.len() {
            let len = PAGE_SIZE.min(region.len() - offset);
            out[..len].copy_from_slice(&region[offset..offset + len]);
        }
    }
}

/// Body signature of a user program. The returned `Ok` value is the
/// process's exit status; `Trap::Exit` terminates it mid-body through
/// `?` exactly like the `exit` syscall.
pub type ProgramBody = dyn Fn(&mut UserContext) -> Result<i32, Trap> + Send + Sync;

/// A loadable program: image plus entry body.
pub struct Program {
    pub(crate) image: Arc<ProgramImage>,
    pub(crate) body: Arc<ProgramBody>,
}

impl Program {
    pub fn new(
        image: ProgramImage,
        body: impl Fn(&mut UserContext) -> Result<i32, Trap> + Send + Sync + 'static,
    ) -> Self {
        Self { image: Arc::new(image), body: Arc::new(body) }
    }

    /// A program with an empty image (stack and argument pages only).
    pub fn from_fn(
        body: impl Fn(&mut UserContext) -> Result<i32, Trap> + Send + Sync + 'static,
    ) -> Self {
        Self::new(ProgramImage::default(), body)
    }
}

/// Name-to-program store consulted by `exec`.
#[derive(Default)]
pub struct ProgramRegistry {
    programs: RwLock<HashMap<String, Arc<Program>>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `program` under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, program: Program) {
        self.programs.write().insert(name.into(), Arc::new(program));
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Program>> {
        self.programs.read().get(name).cloned()
    }
}
