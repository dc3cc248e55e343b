// Copyright 2025 Ferrite OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: File syscall end-to-end tests
//! INTENT: creat/open/read/write/close/unlink round trips through
//!         virtual memory, console behaviour on fds 0/1, and the full
//!         create-write-echo-halt fixture sequence.

use ferrite::{ExitStatus, Program, UserContext, PAGE_SIZE};
use proc_e2e::{boot, run_root};

/// Writes `len` patterned bytes to `name` and reads them back through a
/// separate descriptor and a separate region of virtual memory.
fn round_trip(ctx: &UserContext, name: &str, len: usize) -> Result<(), ferrite::Trap> {
    let src = ctx.stack_base();
    let dst = src + 4 * PAGE_SIZE;
    let pattern: Vec<u8> = (0..len).map(|i| (i * 7 + 13) as u8).collect();
    ctx.vm_write(src, &pattern)?;

    let fd = ctx.sys_creat(name);
    assert!(fd >= 0);
    assert_eq!(ctx.sys_write(fd, src, len)?, len as i32);
    assert_eq!(ctx.sys_close(fd), 0);

    let fd = ctx.sys_open(name);
    assert!(fd >= 0);
    assert_eq!(ctx.sys_read(fd, dst, len)?, len as i32);
    // EOF after the full content.
    assert_eq!(ctx.sys_read(fd, dst, 1)?, 0);
    assert_eq!(ctx.sys_close(fd), 0);

    let mut back = vec![0u8; len];
    ctx.vm_read(dst, &mut back)?;
    if back != pattern {
        return Err(ctx.sys_exit(1));
    }
    Ok(())
}

#[test]
fn round_trips_span_zero_one_and_many_pages() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (_dir, kernel) = boot();
    kernel.register_program(
        "sizes",
        Program::from_fn(|ctx| {
            round_trip(ctx, "empty.bin", 0)?;
            round_trip(ctx, "page.bin", PAGE_SIZE)?;
            round_trip(ctx, "multi.bin", 3 * PAGE_SIZE + 17)?;
            Err(ctx.sys_exit(0))
        }),
    );
    assert_eq!(run_root(&kernel, "sizes", &[]), ExitStatus::Normal(0));
}

#[test]
fn unlink_succeeds_exactly_once() {
    let (_dir, kernel) = boot();
    kernel.register_program(
        "unlinker",
        Program::from_fn(|ctx| {
            assert!(ctx.sys_creat("doomed") >= 0);
            assert_eq!(ctx.sys_unlink("doomed"), 0);
            assert_eq!(ctx.sys_unlink("doomed"), -1);
            assert_eq!(ctx.sys_open("doomed"), -1);
            assert_eq!(ctx.sys_unlink("never-existed"), -1);
            Err(ctx.sys_exit(0))
        }),
    );
    assert_eq!(run_root(&kernel, "unlinker", &[]), ExitStatus::Normal(0));
}

#[test]
fn creat_reuses_the_descriptor_already_open_under_the_name() {
    let (_dir, kernel) = boot();
    kernel.register_program(
        "reuser",
        Program::from_fn(|ctx| {
            let first = ctx.sys_creat("again.txt");
            assert!(first >= 0);
            assert_eq!(ctx.sys_creat("again.txt"), first);

            assert_eq!(ctx.sys_close(first), 0);
            let reopened = ctx.sys_creat("again.txt");
            assert_eq!(reopened, first, "lowest free descriptor comes back");
            Err(ctx.sys_exit(0))
        }),
    );
    assert_eq!(run_root(&kernel, "reuser", &[]), ExitStatus::Normal(0));
}

#[test]
fn descriptor_table_is_bounded_per_process() {
    let (_dir, kernel) = boot_with_max_files(6);
    kernel.register_program(
        "greedy",
        Program::from_fn(|ctx| {
            // fds 0/1 are the console; four files fit, the fifth fails.
            for i in 0..4 {
                assert!(ctx.sys_creat(&format!("file{i}")) >= 0);
            }
            assert_eq!(ctx.sys_creat("one-too-many"), -1);
            assert_eq!(ctx.sys_close(2), 0);
            assert!(ctx.sys_creat("one-too-many") >= 0);
            Err(ctx.sys_exit(0))
        }),
    );
    assert_eq!(run_root(&kernel, "greedy", &[]), ExitStatus::Normal(0));
}

fn boot_with_max_files(max: usize) -> (tempfile::TempDir, ferrite::Kernel) {
    proc_e2e::boot_with(|config| config.max_open_files = max)
}

#[test]
fn files_are_shared_across_the_process_tree() {
    let (_dir, kernel) = boot();
    kernel.register_program(
        "writer",
        Program::from_fn(|ctx| {
            let buf = ctx.stack_base();
            ctx.vm_write(buf, b"from the child")?;
            let fd = ctx.sys_creat("shared.txt");
            assert_eq!(ctx.sys_write(fd, buf, 14)?, 14);
            Err(ctx.sys_exit(0))
        }),
    );
    kernel.register_program(
        "root",
        Program::from_fn(|ctx| {
            let pid = ctx.sys_exec("writer", &[]);
            let mut status = -1;
            assert_eq!(ctx.sys_join(pid, &mut status), 1);
            assert_eq!(status, 0);

            let buf = ctx.stack_base();
            let fd = ctx.sys_open("shared.txt");
            assert!(fd >= 0);
            assert_eq!(ctx.sys_read(fd, buf, 14)?, 14);
            let mut back = [0u8; 14];
            ctx.vm_read(buf, &mut back)?;
            assert_eq!(&back, b"from the child");
            Err(ctx.sys_exit(0))
        }),
    );
    assert_eq!(run_root(&kernel, "root", &[]), ExitStatus::Normal(0));
}

#[test]
fn create_write_echo_halt_sequence() {
    // The classic smoke fixture: file round trip, double unlink, echo
    // console input until 'q', announce success, halt.
    let (_dir, kernel) = boot();
    kernel.console().push_input(b"abcq");
    kernel.register_program(
        "smoke",
        Program::from_fn(|ctx| {
            let buf = ctx.stack_base();
            let scratch = buf + PAGE_SIZE;

            ctx.vm_write(buf, b"123456789\0")?;
            let fd = ctx.sys_creat("test.txt");
            if fd == -1 {
                return Err(ctx.sys_exit(1));
            }
            if ctx.sys_write(fd, buf, 10)? != 10 {
                return Err(ctx.sys_exit(2));
            }
            if ctx.sys_close(fd) == -1 {
                return Err(ctx.sys_exit(3));
            }
            let fd = ctx.sys_open("test.txt");
            if fd == -1 {
                return Err(ctx.sys_exit(4));
            }
            if ctx.sys_read(fd, scratch, 10)? != 10 {
                return Err(ctx.sys_exit(5));
            }
            if ctx.sys_unlink("test.txt") == -1 {
                return Err(ctx.sys_exit(6));
            }
            if ctx.sys_unlink("test.txt") != -1 {
                return Err(ctx.sys_exit(7));
            }

            loop {
                if ctx.sys_read(0, scratch, 1)? != 1 {
                    return Err(ctx.sys_exit(8));
                }
                ctx.sys_write(1, scratch, 1)?;
                let mut byte = [0u8; 1];
                ctx.vm_read(scratch, &mut byte)?;
                if byte[0] == b'q' {
                    break;
                }
            }

            ctx.vm_write(scratch, b"TESTS PASSED\n")?;
            ctx.sys_write(1, scratch, 13)?;
            ctx.sys_halt();
            Ok(0)
        }),
    );

    assert_eq!(run_root(&kernel, "smoke", &[]), ExitStatus::Normal(0));
    assert!(kernel.halted());
    assert_eq!(kernel.console().take_output(), b"abcqTESTS PASSED\n");
}
