// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! File syscall collaborators.
//!
//! The file system proper is outside the kernel core; it is reached
//! through the `FileSystem`/`OpenFile` seam. `MemFileSystem` is the
//! stock in-memory implementation the tests run against, and `Console`
//! is the device behind fds 0 and 1.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

/// An open file handle with a private stream position.
pub trait OpenFile: Send {
    /// Name the handle was opened under (used by the creat-reuse and
    /// unlink-closes-fd rules).
    fn name(&self) -> &str;
    /// Reads from the current position; 0 at end of file.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    /// Writes at the current position, extending the file as needed.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
}

/// Opaque file-system surface consumed by the syscall layer.
pub trait FileSystem: Send + Sync {
    /// Opens `path`; with `create` the file is created if missing
    /// (existing content is kept). `None` when the path does not
    /// resolve.
    fn open(&self, path: &str, create: bool) -> Option<Box<dyn OpenFile>>;
    /// Removes the directory entry for `path`. Open handles stay
    /// usable. `false` when the path does not resolve.
    fn remove(&self, path: &str) -> bool;
}

/// In-memory file system: a name table of shared byte vectors.
#[derive(Default)]
pub struct MemFileSystem {
    files: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSystem for MemFileSystem {
    fn open(&self, path: &str, create: bool) -> Option<Box<dyn OpenFile>> {
        let mut files = self.files.lock();
        let data = match files.get(path) {
            Some(data) => Arc::clone(data),
            None if create => {
                let data = Arc::new(Mutex::new(Vec::new()));
                files.insert(path.to_string(), Arc::clone(&data));
                data
            }
            None => return None,
        };
        trace!(target: "fs", "open {path} create={create}");
        Some(Box::new(MemFile { name: path.to_string(), data, pos: 0 }))
    }

    fn remove(&self, path: &str) -> bool {
        let removed = self.files.lock().remove(path).is_some();
        trace!(target: "fs", "remove {path} -> {removed}");
        removed
    }
}

struct MemFile {
    name: String,
    data: Arc<Mutex<Vec<u8>>>,
    pos: usize,
}

impl OpenFile for MemFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self.data.lock();
        let available = data.len().saturating_sub(self.pos);
        let len = buf.len().min(available);
        buf[..len].copy_from_slice(&data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(len)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut data = self.data.lock();
        if self.pos > data.len() {
            data.resize(self.pos, 0);
        }
        let end = self.pos + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }
}

/// The console device behind fds 0 and 1. Output is captured; input is
/// a queue tests seed. Reads do not block: an empty queue reads as EOF.
#[derive(Default)]
pub struct Console {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes to the input queue (host/test side).
    pub fn push_input(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    /// Drains and returns everything written to fd 1 so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.output.lock())
    }
}

struct ConsoleInput {
    console: Arc<Console>,
}

impl OpenFile for ConsoleInput {
    fn name(&self) -> &str {
        "<stdin>"
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut input = self.console.input.lock();
        let len = buf.len().min(input.len());
        for byte in buf.iter_mut().take(len) {
            *byte = input.pop_front().expect("queue length checked");
        }
        Ok(len)
    }

    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "stdin is read-only"))
    }
}

struct ConsoleOutput {
    console: Arc<Console>,
}

impl OpenFile for ConsoleOutput {
    fn name(&self) -> &str {
        "<stdout>"
    }

    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "stdout is write-only"))
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.console.output.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Per-process descriptor table. Fds 0/1 are pre-bound to the console;
/// 2.. are allocated lowest-first.
pub struct FdTable {
    entries: Vec<Option<Box<dyn OpenFile>>>,
}

impl FdTable {
    pub fn new(max_open_files: usize, console: &Arc<Console>) -> Self {
        let mut entries: Vec<Option<Box<dyn OpenFile>>> =
            (0..max_open_files).map(|_| None).collect();
        entries[0] = Some(Box::new(ConsoleInput { console: Arc::clone(console) }));
        entries[1] = Some(Box::new(ConsoleOutput { console: Arc::clone(console) }));
        Self { entries }
    }

    /// Installs `file` in the lowest free descriptor, or `None` when the
    /// table is full.
    pub fn install(&mut self, file: Box<dyn OpenFile>) -> Option<usize> {
        let free = self.entries.iter().position(Option::is_none)?;
        self.entries[free] = Some(file);
        Some(free)
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut Box<dyn OpenFile>> {
        self.entries.get_mut(fd).and_then(Option::as_mut)
    }

    /// Closes `fd`; `false` if it was not open.
    pub fn close(&mut self, fd: usize) -> bool {
        match self.entries.get_mut(fd) {
            Some(entry @ Some(_)) => {
                *entry = None;
                true
            }
            _ => false,
        }
    }

    /// Descriptor (≥ 2) currently open under `name`, if any.
    pub fn find_named(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .skip(2)
            .find(|(_, entry)| entry.as_ref().is_some_and(|file| file.name() == name))
            .map(|(fd, _)| fd)
    }
}
