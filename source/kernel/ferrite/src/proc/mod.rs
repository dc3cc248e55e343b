// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process control blocks and lifecycle transitions
//! PUBLIC API: ProcessTable (create/lookup/exit/join/await_exit), Pcb, ExitStatus, Trap
//! DEPENDS_ON: mm::fault::MemoryManager (release on exit), fs::FdTable
//! INVARIANTS: Pids monotonic and never reused; exit status set exactly once;
//!             memory released before the PCB becomes reapable; one reap per child.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::fs::FdTable;
use crate::mm::address_space::AddressSpace;
use crate::mm::fault::{FaultError, MemoryManager};
use crate::types::Pid;

/// Why a process was terminated abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Memory access outside every valid segment (or a read-only
    /// violation).
    InvalidAccess,
    /// Resource exhaustion while resolving a fault.
    OutOfMemory,
    /// The program body aborted on the host (e.g. a failed assertion).
    Aborted,
}

impl From<FaultError> for TrapKind {
    fn from(value: FaultError) -> Self {
        match value {
            FaultError::InvalidAccess => Self::InvalidAccess,
            FaultError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

/// Non-local exit of a user program body. `Exit` is the `exit` syscall
/// propagating through `?`; `Fault` kills the process abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Exit(i32),
    Fault(TrapKind),
}

impl From<FaultError> for Trap {
    fn from(value: FaultError) -> Self {
        Self::Fault(value.into())
    }
}

/// Final status of a terminated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with a user-supplied code.
    Normal(i32),
    /// Killed by the kernel; no user status is meaningful.
    Fault(TrapKind),
}

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Live,
    Zombie,
    Reaped,
}

/// Errors returned when joining on a child.
#[must_use = "join errors must be handled explicitly"]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// Pid was never handed out, or its process is already reaped.
    #[error("unknown pid")]
    UnknownPid,
    /// Pid names a process that is not a child of the caller.
    #[error("not a child of the caller")]
    NotChild,
}

pub(crate) struct PcbInner {
    pub(crate) parent: Option<Pid>,
    /// Orphans auto-reap at exit; nobody will join them.
    pub(crate) detached: bool,
    pub(crate) state: ProcState,
    pub(crate) status: Option<ExitStatus>,
    pub(crate) children: BTreeSet<Pid>,
    pub(crate) space: Option<Arc<AddressSpace>>,
    pub(crate) files: Option<FdTable>,
}

/// Process control block. The condvar is signalled exactly once, by the
/// matching exit.
pub struct Pcb {
    pid: Pid,
    inner: Mutex<PcbInner>,
    exited: Condvar,
}

impl Pcb {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        self.inner.lock().state
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.lock().status
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PcbInner> {
        self.inner.lock()
    }
}

struct TableInner {
    next_pid: u32,
    procs: HashMap<Pid, Arc<Pcb>>,
}

/// Registry of all processes, keyed by monotonically assigned pids.
pub struct ProcessTable {
    inner: Mutex<TableInner>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(TableInner { next_pid: 0, procs: HashMap::new() }) }
    }

    /// Creates a live PCB. With a parent, the child is linked into the
    /// parent's child set; without one, the process is a root the host
    /// observes through [`ProcessTable::await_exit`].
    pub fn create(
        &self,
        parent: Option<Pid>,
        space: Arc<AddressSpace>,
        files: FdTable,
    ) -> (Pid, Arc<Pcb>) {
        let mut inner = self.inner.lock();
        let pid = Pid::from_raw(inner.next_pid);
        inner.next_pid += 1;
        let pcb = Arc::new(Pcb {
            pid,
            inner: Mutex::new(PcbInner {
                parent,
                detached: false,
                state: ProcState::Live,
                status: None,
                children: BTreeSet::new(),
                space: Some(space),
                files: Some(files),
            }),
            exited: Condvar::new(),
        });
        inner.procs.insert(pid, Arc::clone(&pcb));
        if let Some(parent_pid) = parent {
            let parent_pcb = inner.procs.get(&parent_pid).expect("exec caller is live");
            parent_pcb.lock().children.insert(pid);
        }
        debug!(target: "proc", "created pid={pid} parent={parent:?}");
        (pid, pcb)
    }

    pub fn lookup(&self, pid: Pid) -> Option<Arc<Pcb>> {
        self.inner.lock().procs.get(&pid).cloned()
    }

    /// Records `status` if none is set yet (first-writer-wins).
    pub fn set_exit_status(&self, pid: Pid, status: ExitStatus) {
        if let Some(pcb) = self.lookup(pid) {
            let mut inner = pcb.lock();
            if inner.status.is_none() {
                inner.status = Some(status);
            }
        }
    }

    /// Terminates `pid`: records the status (first-writer-wins), closes
    /// its files, releases its memory, orphans or reaps its children,
    /// and only then marks it reapable and wakes any joiner.
    pub fn exit(&self, pid: Pid, status: ExitStatus, memory: &MemoryManager) {
        let Some(pcb) = self.lookup(pid) else {
            return;
        };

        let (space, files, children) = {
            let mut inner = pcb.lock();
            debug_assert_eq!(inner.state, ProcState::Live, "double exit of pid {pid}");
            if inner.status.is_none() {
                inner.status = Some(status);
            }
            (inner.space.take(), inner.files.take(), std::mem::take(&mut inner.children))
        };

        // Resource release must complete before the PCB is observable as
        // terminated, or a joiner could see a dead process still owning
        // frames.
        drop(files);
        if let Some(space) = space {
            memory.release_space(pid, &space);
        }

        for child_pid in children {
            let Some(child) = self.lookup(child_pid) else {
                continue;
            };
            let reap_now = {
                let mut child_inner = child.lock();
                child_inner.parent = None;
                child_inner.detached = true;
                child_inner.state == ProcState::Zombie
            };
            if reap_now {
                let _ = self.reap(child_pid);
            }
        }

        let auto_reap = {
            let mut inner = pcb.lock();
            inner.state = ProcState::Zombie;
            let auto_reap = inner.detached;
            pcb.exited.notify_all();
            auto_reap
        };
        if auto_reap {
            let _ = self.reap(pid);
        }
        debug!(target: "proc", "exited pid={pid} status={status:?} auto_reap={auto_reap}");
    }

    /// Blocks until child `child` of `caller` terminates, then reaps it.
    /// Exactly one join can succeed per child.
    pub fn join(&self, caller: Pid, child: Pid) -> Result<ExitStatus, JoinError> {
        let pcb = self.lookup(child).ok_or(JoinError::UnknownPid)?;
        {
            let inner = pcb.lock();
            if inner.parent != Some(caller) {
                return Err(JoinError::NotChild);
            }
        }

        {
            let mut inner = pcb.lock();
            while inner.state == ProcState::Live {
                pcb.exited.wait(&mut inner);
            }
        }
        let status = self.reap(child).ok_or(JoinError::UnknownPid)?;
        if let Some(caller_pcb) = self.lookup(caller) {
            caller_pcb.lock().children.remove(&child);
        }
        debug!(target: "proc", "pid={caller} reaped child={child} status={status:?}");
        Ok(status)
    }

    /// Transitions a zombie to reaped and drops it from the table,
    /// returning its status. `None` for unknown pids or processes that
    /// are not (or no longer) reapable; a second reap always fails.
    pub fn reap(&self, pid: Pid) -> Option<ExitStatus> {
        let pcb = self.lookup(pid)?;
        let status = {
            let mut inner = pcb.lock();
            if inner.state != ProcState::Zombie {
                return None;
            }
            inner.state = ProcState::Reaped;
            inner.status.expect("zombie carries a status")
        };
        self.remove(pid);
        Some(status)
    }

    /// Host-side wait for a root process (no parent). Reaps it.
    pub fn await_exit(&self, pid: Pid) -> Option<ExitStatus> {
        let pcb = self.lookup(pid)?;
        {
            let mut inner = pcb.lock();
            while inner.state == ProcState::Live {
                pcb.exited.wait(&mut inner);
            }
        }
        self.reap(pid)
    }

    /// Number of registered (live or zombie) processes.
    pub fn len(&self) -> usize {
        self.inner.lock().procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().procs.is_empty()
    }

    /// Removes a PCB that never came to life (failed exec), unlinking
    /// it from its parent's child set.
    pub(crate) fn discard(&self, pid: Pid) {
        let Some(pcb) = self.lookup(pid) else {
            return;
        };
        let parent = pcb.lock().parent;
        if let Some(parent_pid) = parent {
            if let Some(parent_pcb) = self.lookup(parent_pid) {
                parent_pcb.lock().children.remove(&pid);
            }
        }
        self.remove(pid);
    }

    fn remove(&self, pid: Pid) {
        self.inner.lock().procs.remove(&pid);
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
