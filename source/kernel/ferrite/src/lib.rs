// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! FERRITE kernel core.
//!
//! A hosted teaching-OS kernel: process lifecycle (`exec`/`join`/`exit`/
//! `halt`) on top of a demand-paged virtual memory subsystem with a
//! file-backed swap store. The "machine" is simulated: physical memory
//! is an in-process frame table, processes are host threads, and user
//! programs are registered bodies driven through the syscall surface.
//!
//! ```no_run
//! use ferrite::{Kernel, KernelConfig, Program};
//!
//! let kernel = Kernel::new(KernelConfig::default())?;
//! kernel.register_program(
//!     "hello",
//!     Program::from_fn(|ctx| Err(ctx.sys_exit(0))),
//! );
//! let root = kernel.exec_root("hello", &[])?;
//! kernel.wait(root);
//! kernel.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod fs;
pub mod kernel;
pub mod loader;
pub mod mm;
pub mod proc;
pub mod syscall;
pub mod types;

pub use config::{HaltPolicy, KernelConfig};
pub use fs::{Console, FileSystem, MemFileSystem, OpenFile};
pub use kernel::{ExecError, FrameAccounting, Kernel, UserContext};
pub use loader::{Program, ProgramImage, ProgramRegistry};
pub use mm::fault::FaultError;
pub use mm::PAGE_SIZE;
pub use proc::{ExitStatus, JoinError, ProcState, Trap, TrapKind};
pub use syscall::{encode_data_mismatch, EXIT_ALL_CHECKS_PASSED};
pub use types::{FrameId, Pid, SlotId, VirtPage};
