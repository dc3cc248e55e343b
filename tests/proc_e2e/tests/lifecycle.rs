// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process lifecycle end-to-end tests
//! INTENT: exec/join/exit/halt semantics across whole process trees:
//!         status delivery, reap-once, orphans, and halt gating.

use ferrite::{ExitStatus, Program, TrapKind};
use proc_e2e::{boot, run_root};

#[test]
fn ping_pong_join_loop() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (_dir, kernel) = boot();
    kernel.register_program("ping", Program::from_fn(|ctx| Err(ctx.sys_exit(0))));
    kernel.register_program(
        "pong",
        Program::from_fn(|ctx| {
            for _ in 0..20 {
                let pid = ctx.sys_exec("ping", &[]);
                assert!(pid >= 0);
                let mut status = -1;
                if ctx.sys_join(pid, &mut status) != 1 || status != 0 {
                    return Err(ctx.sys_exit(1));
                }
            }
            Err(ctx.sys_exit(0))
        }),
    );
    assert_eq!(run_root(&kernel, "pong", &[]), ExitStatus::Normal(0));
    assert_eq!(kernel.process_count(), 0);
}

#[test]
fn each_child_status_is_delivered_exactly_once() {
    let (_dir, kernel) = boot();
    kernel.register_program(
        "echo-arg",
        Program::from_fn(|ctx| {
            let args = ctx.args()?;
            Err(ctx.sys_exit(args[0].parse().expect("numeric arg")))
        }),
    );
    kernel.register_program(
        "fanout",
        Program::from_fn(|ctx| {
            let codes = [11, 22, 33, 44, 55, 66, 77, 88];
            let pids: Vec<i32> = codes
                .iter()
                .map(|code| ctx.sys_exec("echo-arg", &[&code.to_string()]))
                .collect();
            assert!(pids.iter().all(|pid| *pid >= 0));

            // Join in reverse order: statuses must match regardless of
            // completion order, and no status may be lost or duplicated.
            for (pid, code) in pids.iter().zip(codes.iter()).rev() {
                let mut status = 0;
                if ctx.sys_join(*pid, &mut status) != 1 || status != *code {
                    return Err(ctx.sys_exit(1));
                }
                if ctx.sys_join(*pid, &mut status) != -1 {
                    return Err(ctx.sys_exit(2));
                }
            }
            Err(ctx.sys_exit(0))
        }),
    );
    assert_eq!(run_root(&kernel, "fanout", &[]), ExitStatus::Normal(0));
}

#[test]
fn grandchildren_are_joined_by_their_own_parent_only() {
    let (_dir, kernel) = boot();
    kernel.register_program("leaf", Program::from_fn(|ctx| Err(ctx.sys_exit(3))));
    kernel.register_program(
        "middle",
        Program::from_fn(|ctx| {
            let pid = ctx.sys_exec("leaf", &[]);
            let mut status = 0;
            assert_eq!(ctx.sys_join(pid, &mut status), 1);
            // Report the grandchild's pid upward so the root can try
            // (and fail) to join someone else's child.
            Err(ctx.sys_exit(pid * 100 + status))
        }),
    );
    kernel.register_program(
        "root",
        Program::from_fn(|ctx| {
            let pid = ctx.sys_exec("middle", &[]);
            let mut status = 0;
            assert_eq!(ctx.sys_join(pid, &mut status), 1);
            let leaf_pid = status / 100;
            assert_eq!(status % 100, 3);
            // The leaf was never our child (and is reaped anyway).
            assert_eq!(ctx.sys_join(leaf_pid, &mut status), -1);
            Err(ctx.sys_exit(0))
        }),
    );
    assert_eq!(run_root(&kernel, "root", &[]), ExitStatus::Normal(0));
}

#[test]
fn orphans_drain_without_a_joiner() {
    let (_dir, kernel) = boot();
    kernel.register_program(
        "worker",
        Program::from_fn(|ctx| {
            // Touch some memory so the orphan actually owns resources
            // when its parent disappears.
            ctx.vm_write(ctx.stack_base(), &[7u8; 256])?;
            Err(ctx.sys_exit(0))
        }),
    );
    kernel.register_program(
        "deserter",
        Program::from_fn(|ctx| {
            let pid = ctx.sys_exec("worker", &[]);
            // Exit immediately without joining.
            Err(ctx.sys_exit(pid))
        }),
    );
    kernel.register_program(
        "root",
        Program::from_fn(|ctx| {
            let pid = ctx.sys_exec("deserter", &[]);
            let mut orphan_pid = -1;
            assert_eq!(ctx.sys_join(pid, &mut orphan_pid), 1);
            // The orphan is not ours to join, whether or not it has
            // already exited.
            assert_eq!(ctx.sys_join(orphan_pid, &mut 0), -1);
            Err(ctx.sys_exit(0))
        }),
    );
    assert_eq!(run_root(&kernel, "root", &[]), ExitStatus::Normal(0));

    // Every thread has drained; the orphan reaped itself.
    assert_eq!(kernel.process_count(), 0);
    let accounting = kernel.frame_accounting();
    assert_eq!(accounting.owned, 0);
    assert_eq!(kernel.swap_slots_in_use(), 0);
}

#[test]
fn crash_in_a_child_is_contained() {
    let (_dir, kernel) = boot();
    kernel.register_program(
        "crasher",
        Program::from_fn(|ctx| {
            ctx.vm_write_i32(usize::MAX - 7, 1)?;
            Ok(0)
        }),
    );
    kernel.register_program(
        "root",
        Program::from_fn(|ctx| {
            let pid = ctx.sys_exec("crasher", &[]);
            let mut status = 424_242;
            let code = ctx.sys_join(pid, &mut status);
            // Abnormal termination: code 0, status slot untouched.
            assert_eq!(code, 0);
            assert_eq!(status, 424_242);
            // The kernel is still healthy enough to run more children.
            let pid = ctx.sys_exec("crasher", &[]);
            assert!(pid >= 0);
            assert_eq!(ctx.sys_join(pid, &mut status), 0);
            Err(ctx.sys_exit(0))
        }),
    );
    assert_eq!(run_root(&kernel, "root", &[]), ExitStatus::Normal(0));
}

#[test]
fn root_crash_reports_fault_to_the_host() {
    let (_dir, kernel) = boot();
    kernel.register_program(
        "wild",
        Program::from_fn(|ctx| {
            let mut byte = [0u8; 1];
            ctx.vm_read(ctx.memory_size(), &mut byte)?;
            Ok(0)
        }),
    );
    assert_eq!(
        run_root(&kernel, "wild", &[]),
        ExitStatus::Fault(TrapKind::InvalidAccess)
    );
}

#[test]
fn halt_cascades_to_the_whole_tree() {
    let (_dir, kernel) = boot();
    kernel.register_program("idle", Program::from_fn(|_| Ok(0)));
    kernel.register_program(
        "root",
        Program::from_fn(|ctx| {
            let before = ctx.sys_exec("idle", &[]);
            assert!(before >= 0);
            let mut status = 0;
            assert_eq!(ctx.sys_join(before, &mut status), 1);

            assert_eq!(ctx.sys_halt(), 0);
            assert_eq!(ctx.sys_exec("idle", &[]), -1);
            Ok(0)
        }),
    );
    assert_eq!(run_root(&kernel, "root", &[]), ExitStatus::Normal(0));
    assert!(kernel.halted());
    assert!(kernel.exec_root("idle", &[]).is_err());
}
