// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use ferrite::{Kernel, KernelConfig};

/// Boots a kernel with `num_frames` frames and a private swap file.
/// The returned tempdir owns the swap file's lifetime.
pub fn boot_small_machine(num_frames: usize) -> (tempfile::TempDir, Kernel) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = KernelConfig::with_frames(num_frames, dir.path().join("swap"));
    let kernel = Kernel::new(config).expect("boot kernel");
    (dir, kernel)
}

/// Runs `name` as the root process and returns its raw exit code,
/// panicking if it terminated abnormally.
pub fn run_to_completion(kernel: &Kernel, name: &str, args: &[&str]) -> i32 {
    let pid = kernel.exec_root(name, args).expect("exec root");
    let status = kernel.wait(pid).expect("root reports a status");
    kernel.shutdown();
    match status {
        ferrite::ExitStatus::Normal(code) => code,
        ferrite::ExitStatus::Fault(kind) => panic!("root crashed: {kind:?}"),
    }
}
