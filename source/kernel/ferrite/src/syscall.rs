// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integer-convention syscall surface
//! PUBLIC API: UserContext::sys_* for the ten stable calls
//! DEPENDS_ON: kernel::{KernelState,UserContext}, proc, fs
//! INVARIANTS: Stable numbers; user-visible errors are ordinary negative returns,
//!             never a kill; only genuine memory traps terminate the caller.
//!
//! | # | call   | success            | failure |
//! |---|--------|--------------------|---------|
//! | 0 | halt   | system stops       | no-op / -1 if unprivileged (policy) |
//! | 1 | exit   | does not return    | -  |
//! | 2 | exec   | pid >= 0           | -1 |
//! | 3 | join   | 1 normal, 0 crash  | -1 unknown/foreign child |
//! | 4 | creat  | fd >= 0            | -1 |
//! | 5 | open   | fd >= 0            | -1 not found |
//! | 6 | read   | bytes (0 at EOF)   | -1 |
//! | 7 | write  | bytes written      | -1 |
//! | 8 | close  | 0                  | -1 |
//! | 9 | unlink | 0                  | -1 not found |

use crate::kernel::UserContext;
use crate::proc::{ExitStatus, Trap, TrapKind};
use crate::types::Pid;

pub const SYSCALL_HALT: usize = 0;
pub const SYSCALL_EXIT: usize = 1;
pub const SYSCALL_EXEC: usize = 2;
pub const SYSCALL_JOIN: usize = 3;
pub const SYSCALL_CREAT: usize = 4;
pub const SYSCALL_OPEN: usize = 5;
pub const SYSCALL_READ: usize = 6;
pub const SYSCALL_WRITE: usize = 7;
pub const SYSCALL_CLOSE: usize = 8;
pub const SYSCALL_UNLINK: usize = 9;

/// Exit status a fixture reports when every check passed.
pub const EXIT_ALL_CHECKS_PASSED: i32 = -1000;

/// Encodes the first corrupted datum a validation pass found, exactly as
/// the fixtures expect: `index * 1_000_000 + bad_value`.
pub fn encode_data_mismatch(index: usize, bad_value: i32) -> i32 {
    index as i32 * 1_000_000 + bad_value
}

impl UserContext {
    /// `halt()`: the root stops the whole system; for anyone else the
    /// configured policy applies (silent no-op or -1).
    pub fn sys_halt(&self) -> i32 {
        self.state.halt(self.pid)
    }

    /// `exit(status)`: does not return; the trap propagates out of the
    /// program body through `?`.
    pub fn sys_exit(&self, status: i32) -> Trap {
        Trap::Exit(status)
    }

    /// `exec(name, args)`: pid of the new child, or -1.
    pub fn sys_exec(&self, name: &str, args: &[&str]) -> i32 {
        match self.state.exec(Some(self.pid), name, args, false) {
            Ok(pid) => pid.as_raw() as i32,
            Err(err) => {
                log::debug!(target: "sys", "exec {name:?} failed: {err}");
                -1
            }
        }
    }

    /// `join(pid, &status)`: 1 and the child's status on a normal exit,
    /// 0 on an abnormal one, -1 for an unknown or foreign pid.
    pub fn sys_join(&self, pid: i32, status_out: &mut i32) -> i32 {
        if pid < 0 {
            return -1;
        }
        match self.state.processes.join(self.pid, Pid::from_raw(pid as u32)) {
            Ok(ExitStatus::Normal(status)) => {
                *status_out = status;
                1
            }
            Ok(ExitStatus::Fault(_)) => 0,
            Err(_) => -1,
        }
    }

    /// `creat(path)`: fd of a created-or-opened file. A name this
    /// process already has open returns the existing fd.
    pub fn sys_creat(&self, path: &str) -> i32 {
        self.with_files(|ctx, files| {
            if let Some(fd) = files.find_named(path) {
                return fd as i32;
            }
            match ctx.state.fs.open(path, true) {
                Some(file) => files.install(file).map_or(-1, |fd| fd as i32),
                None => -1,
            }
        })
    }

    /// `open(path)`: fd, or -1 when the path does not resolve.
    pub fn sys_open(&self, path: &str) -> i32 {
        self.with_files(|ctx, files| match ctx.state.fs.open(path, false) {
            Some(file) => files.install(file).map_or(-1, |fd| fd as i32),
            None => -1,
        })
    }

    /// `read(fd, buf, n)`: transfers from the file into this process's
    /// virtual memory. Returns bytes read (0 at EOF) or -1; a resource
    /// exhaustion while faulting the buffer in terminates the caller.
    pub fn sys_read(&self, fd: i32, vaddr: usize, len: usize) -> Result<i32, Trap> {
        if fd < 0 || !self.buffer_in_range(vaddr, len) {
            return Ok(-1);
        }
        let mut buf = vec![0u8; len];
        let read = self.with_files(|_, files| {
            files.get_mut(fd as usize).and_then(|file| file.read(&mut buf).ok())
        });
        let Some(read) = read else {
            return Ok(-1);
        };
        match self.vm_write(vaddr, &buf[..read]) {
            Ok(()) => Ok(read as i32),
            Err(Trap::Fault(TrapKind::InvalidAccess)) => Ok(-1),
            Err(trap) => Err(trap),
        }
    }

    /// `write(fd, buf, n)`: transfers from this process's virtual
    /// memory into the file. Returns bytes written or -1.
    pub fn sys_write(&self, fd: i32, vaddr: usize, len: usize) -> Result<i32, Trap> {
        if fd < 0 || !self.buffer_in_range(vaddr, len) {
            return Ok(-1);
        }
        let mut buf = vec![0u8; len];
        match self.vm_read(vaddr, &mut buf) {
            Ok(()) => {}
            Err(Trap::Fault(TrapKind::InvalidAccess)) => return Ok(-1),
            Err(trap) => return Err(trap),
        }
        let written = self.with_files(|_, files| {
            files.get_mut(fd as usize).and_then(|file| file.write(&buf).ok())
        });
        Ok(written.map_or(-1, |written| written as i32))
    }

    /// `close(fd)`: 0, or -1 for a descriptor that is not open.
    pub fn sys_close(&self, fd: i32) -> i32 {
        if fd < 0 {
            return -1;
        }
        self.with_files(|_, files| if files.close(fd as usize) { 0 } else { -1 })
    }

    /// `unlink(path)`: removes the directory entry; open handles stay
    /// usable. A second unlink of the same path fails. A descriptor this
    /// process holds under `path` is closed first.
    pub fn sys_unlink(&self, path: &str) -> i32 {
        self.with_files(|ctx, files| {
            if let Some(fd) = files.find_named(path) {
                files.close(fd);
            }
            if ctx.state.fs.remove(path) {
                0
            } else {
                -1
            }
        })
    }

    fn buffer_in_range(&self, vaddr: usize, len: usize) -> bool {
        vaddr
            .checked_add(len)
            .is_some_and(|end| end <= self.memory_size())
    }

    fn with_files<R>(&self, body: impl FnOnce(&Self, &mut crate::fs::FdTable) -> R) -> R {
        let pcb = self
            .state
            .processes
            .lookup(self.pid)
            .expect("running process is registered");
        let mut inner = pcb.lock();
        let files = inner.files.as_mut().expect("running process owns its fd table");
        body(self, files)
    }
}
