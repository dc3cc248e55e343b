// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel assembly and process lifecycle driver
//! PUBLIC API: Kernel (exec_root/wait/shutdown), UserContext (vm ops, args), ExecError
//! DEPENDS_ON: mm::fault::MemoryManager, proc::ProcessTable, loader::ProgramRegistry, fs
//! INVARIANTS: One host thread of control per process; exec never blocks the caller;
//!             after halt no new process is admitted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::KernelConfig;
use crate::fs::{Console, FdTable, FileSystem, MemFileSystem};
use crate::loader::{Program, ProgramRegistry};
use crate::mm::address_space::AddressSpace;
use crate::mm::fault::{FaultError, MemoryManager};
use crate::mm::PAGE_SIZE;
use crate::proc::{ExitStatus, ProcessTable, Trap, TrapKind};
use crate::types::Pid;

/// Errors surfaced by `exec` before a process comes to life. The
/// syscall surface collapses all of them to -1.
#[derive(Debug, Error)]
pub enum ExecError {
    /// No program registered under the requested name.
    #[error("unknown program")]
    UnknownProgram,
    /// The system has been halted; no new processes are admitted.
    #[error("system halted")]
    Halted,
    /// The argument block does not fit in the argument page.
    #[error("argument block exceeds one page")]
    ArgsTooLarge,
    /// Faulting in the argument page failed (resource exhaustion).
    #[error("image load failed: {0}")]
    Load(FaultError),
    /// The host refused to give us a thread of control.
    #[error("process thread spawn failed: {0}")]
    Spawn(std::io::Error),
}

/// Frame accounting snapshot; meaningful at quiescent points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAccounting {
    pub owned: usize,
    pub free: usize,
    pub total: usize,
}

pub(crate) struct KernelState {
    pub(crate) config: KernelConfig,
    pub(crate) memory: MemoryManager,
    pub(crate) processes: ProcessTable,
    pub(crate) programs: ProgramRegistry,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) console: Arc<Console>,
    pub(crate) root: Mutex<Option<Pid>>,
    pub(crate) halted: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl KernelState {
    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn is_root(&self, pid: Pid) -> bool {
        *self.root.lock() == Some(pid)
    }

    /// Spawns a process running `name`. The caller resumes immediately;
    /// the new process runs on its own thread of control.
    pub(crate) fn exec(
        self: &Arc<Self>,
        parent: Option<Pid>,
        name: &str,
        args: &[&str],
        register_root: bool,
    ) -> Result<Pid, ExecError> {
        if self.is_halted() {
            return Err(ExecError::Halted);
        }
        let program = self.programs.lookup(name).ok_or(ExecError::UnknownProgram)?;

        // Argument block layout (one page): argc 4-byte string addresses,
        // then the NUL-terminated strings themselves.
        let args_size =
            args.iter().map(|arg| 4 + arg.len() + 1).sum::<usize>();
        if args_size > PAGE_SIZE {
            return Err(ExecError::ArgsTooLarge);
        }

        let space = Arc::new(AddressSpace::new(
            Arc::clone(&program.image),
            self.config.stack_pages,
        ));
        let files = FdTable::new(self.config.max_open_files, &self.console);
        let (pid, _pcb) = self.processes.create(parent, Arc::clone(&space), files);
        if register_root {
            // Must precede the first instruction of the new process, or
            // an immediate `halt` would not recognise its own privilege.
            *self.root.lock() = Some(pid);
        }

        let argv_base = space.args_page().base_addr();
        if let Err(err) = self.write_args(pid, &space, argv_base, args) {
            self.processes.discard(pid);
            self.memory.release_space(pid, &space);
            return Err(ExecError::Load(err));
        }

        let state = Arc::clone(self);
        let body = Arc::clone(&program.body);
        let argc = args.len();
        let thread_space = Arc::clone(&space);
        let thread = std::thread::Builder::new()
            .name(format!("pid-{pid}"))
            .spawn(move || {
                let mut ctx = UserContext {
                    state: Arc::clone(&state),
                    pid,
                    space: thread_space,
                    argc,
                    argv: argv_base,
                };
                // A panicking body must still reach `exit`, or its
                // joiner would block forever.
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    (body)(&mut ctx)
                }));
                let status = match outcome {
                    Ok(Ok(code)) => ExitStatus::Normal(code),
                    Ok(Err(Trap::Exit(code))) => ExitStatus::Normal(code),
                    Ok(Err(Trap::Fault(kind))) => {
                        info!(target: "proc", "pid={pid} killed: {kind:?}");
                        ExitStatus::Fault(kind)
                    }
                    Err(_panic) => {
                        info!(target: "proc", "pid={pid} aborted");
                        ExitStatus::Fault(TrapKind::Aborted)
                    }
                };
                state.processes.exit(pid, status, &state.memory);
            });
        match thread {
            Ok(handle) => {
                self.threads.lock().push(handle);
                debug!(target: "proc", "exec {name:?} -> pid={pid}");
                Ok(pid)
            }
            Err(err) => {
                self.processes.discard(pid);
                self.memory.release_space(pid, &space);
                Err(ExecError::Spawn(err))
            }
        }
    }

    fn write_args(
        &self,
        pid: Pid,
        space: &Arc<AddressSpace>,
        argv_base: usize,
        args: &[&str],
    ) -> Result<(), FaultError> {
        let mut entry_addr = argv_base;
        let mut string_addr = argv_base + args.len() * 4;
        for arg in args {
            self.memory
                .write_bytes(space, pid, entry_addr, &(string_addr as u32).to_le_bytes())?;
            self.memory.write_bytes(space, pid, string_addr, arg.as_bytes())?;
            self.memory.write_bytes(space, pid, string_addr + arg.len(), &[0u8])?;
            entry_addr += 4;
            string_addr += arg.len() + 1;
        }
        Ok(())
    }

    /// `halt` semantics: the root stops the system; everyone else is
    /// subject to the configured policy.
    pub(crate) fn halt(&self, caller: Pid) -> i32 {
        if self.is_root(caller) {
            self.processes.set_exit_status(caller, ExitStatus::Normal(0));
            self.halted.store(true, Ordering::SeqCst);
            info!(target: "sys", "halt by root pid={caller}");
            return 0;
        }
        match self.config.halt_policy {
            crate::config::HaltPolicy::Ignore => {
                debug!(target: "sys", "halt ignored for pid={caller}");
                0
            }
            crate::config::HaltPolicy::Deny => -1,
        }
    }
}

/// The assembled machine: memory subsystem, process registry, program
/// store, file system and console, all behind one handle.
pub struct Kernel {
    state: Arc<KernelState>,
}

impl Kernel {
    /// Boots a kernel with the stock in-memory file system.
    pub fn new(config: KernelConfig) -> std::io::Result<Self> {
        Self::with_file_system(config, Arc::new(MemFileSystem::new()))
    }

    /// Boots a kernel against a caller-provided file system.
    pub fn with_file_system(
        config: KernelConfig,
        fs: Arc<dyn FileSystem>,
    ) -> std::io::Result<Self> {
        let memory = MemoryManager::new(&config)?;
        info!(
            target: "sys",
            "boot: {} frames, swap at {}",
            config.num_frames,
            config.swap_path.display()
        );
        Ok(Self {
            state: Arc::new(KernelState {
                config,
                memory,
                processes: ProcessTable::new(),
                programs: ProgramRegistry::new(),
                fs,
                console: Arc::new(Console::new()),
                root: Mutex::new(None),
                halted: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Registers `program` under `name` for later `exec`.
    pub fn register_program(&self, name: impl Into<String>, program: Program) {
        self.state.programs.register(name, program);
    }

    /// Starts the designated root process. Only the root may `halt`.
    pub fn exec_root(&self, name: &str, args: &[&str]) -> Result<Pid, ExecError> {
        self.state.exec(None, name, args, true)
    }

    /// Blocks until `pid` (a root process) terminates and reaps it.
    pub fn wait(&self, pid: Pid) -> Option<ExitStatus> {
        self.state.processes.await_exit(pid)
    }

    /// Joins every process thread the kernel has spawned so far,
    /// including ones spawned while draining.
    pub fn shutdown(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut threads = self.state.threads.lock();
                threads.drain(..).collect()
            };
            if drained.is_empty() {
                return;
            }
            for handle in drained {
                let _ = handle.join();
            }
        }
    }

    pub fn console(&self) -> Arc<Console> {
        Arc::clone(&self.state.console)
    }

    pub fn halted(&self) -> bool {
        self.state.is_halted()
    }

    /// Frames owned by live processes vs. free. At any quiescent point
    /// `owned + free == total`.
    pub fn frame_accounting(&self) -> FrameAccounting {
        FrameAccounting {
            owned: self.state.memory.owned_frames(),
            free: self.state.memory.free_frames(),
            total: self.state.memory.total_frames(),
        }
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.state.memory.swap_slots_in_use()
    }

    /// Registered (live or zombie) processes.
    pub fn process_count(&self) -> usize {
        self.state.processes.len()
    }
}

/// Handle a user program body runs against: its identity, its address
/// space, and the syscall surface (see the `syscall` module for the
/// integer-convention calls).
pub struct UserContext {
    pub(crate) state: Arc<KernelState>,
    pub(crate) pid: Pid,
    pub(crate) space: Arc<AddressSpace>,
    pub(crate) argc: usize,
    pub(crate) argv: usize,
}

impl UserContext {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Bytes addressable in this process's virtual memory.
    pub fn memory_size(&self) -> usize {
        self.space.size_bytes()
    }

    /// First byte of the stack region, handy scratch space for
    /// programs staging buffers for file syscalls.
    pub fn stack_base(&self) -> usize {
        self.space.stack_base()
    }

    /// Reads from this process's virtual memory, faulting pages in on
    /// demand. Out-of-segment access is a terminating trap.
    pub fn vm_read(&self, vaddr: usize, buf: &mut [u8]) -> Result<(), Trap> {
        self.state.memory.read_bytes(&self.space, self.pid, vaddr, buf)?;
        Ok(())
    }

    /// Writes into this process's virtual memory; same trap rules as
    /// [`UserContext::vm_read`].
    pub fn vm_write(&self, vaddr: usize, bytes: &[u8]) -> Result<(), Trap> {
        self.state.memory.write_bytes(&self.space, self.pid, vaddr, bytes)?;
        Ok(())
    }

    pub fn vm_read_i32(&self, vaddr: usize) -> Result<i32, Trap> {
        let mut raw = [0u8; 4];
        self.vm_read(vaddr, &mut raw)?;
        Ok(i32::from_le_bytes(raw))
    }

    pub fn vm_write_i32(&self, vaddr: usize, value: i32) -> Result<(), Trap> {
        self.vm_write(vaddr, &value.to_le_bytes())
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes.
    /// Returns `None` when no terminator is found in range.
    pub fn vm_read_string(&self, vaddr: usize, max_len: usize) -> Result<Option<String>, Trap> {
        let mut bytes = Vec::with_capacity(max_len.min(256));
        for offset in 0..=max_len {
            let mut byte = [0u8; 1];
            self.vm_read(vaddr + offset, &mut byte)?;
            if byte[0] == 0 {
                return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
            }
            bytes.push(byte[0]);
        }
        Ok(None)
    }

    /// Recovers the argument vector from the argument page.
    pub fn args(&self) -> Result<Vec<String>, Trap> {
        let mut args = Vec::with_capacity(self.argc);
        for index in 0..self.argc {
            let mut raw = [0u8; 4];
            self.vm_read(self.argv + index * 4, &mut raw)?;
            let string_addr = u32::from_le_bytes(raw) as usize;
            let arg = self
                .vm_read_string(string_addr, PAGE_SIZE)?
                .unwrap_or_default();
            args.push(arg);
        }
        Ok(args)
    }
}
