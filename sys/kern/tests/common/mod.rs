// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A toy capsule and some process memory to run it against.

#![allow(dead_code)]

use core::cell::Cell;

use abi::{DriverNum, ErrorCode, ProcessId, ProcessWord, Sysnum, SyscallReturn};
use grant_kern::arch::sim::SavedState;
use grant_kern::driver::SyscallDriver;
use grant_kern::err::GrantError;
use grant_kern::grant::Grant;
use grant_kern::kernel::Kernel;
use grant_kern::process::ProcessMemory;
use grant_kern::syscalls::Outcome;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const ECHO: DriverNum = DriverNum(4);

pub const RAM_START: usize = 0x1000;
pub const RAM_LEN: usize = 0x2000;
pub const APP_BRK: usize = 0x2800;
pub const FLASH_START: usize = 0x8000;
pub const FLASH_LEN: usize = 0x100;

/// Per-process state of the echo capsule.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct Counter {
    pub fired: u32,
    pub last: u32,
    pub total: u64,
}

/// Commands understood by [`Echo`].
pub mod cmd {
    /// Existence check.
    pub const EXISTS: u32 = 0;
    /// Fire subscribe slot `arg1` with `[arg2, times fired, 0]`.
    pub const FIRE: u32 = 1;
    /// Sum the bytes of read-only allow 0.
    pub const SUM: u32 = 2;
    /// Fill read-write allow 0 with the byte `arg1`.
    pub const FILL: u32 = 3;
    /// Report how many times `FIRE` has run for the caller.
    pub const FIRED: u32 = 4;
}

/// Two upcall slots, one read-only and one read-write allow.
pub struct Echo {
    pub grant: Grant<Counter, 2, 1, 1>,
}

impl Echo {
    pub const fn new() -> Self {
        Self {
            grant: Grant::new(ECHO),
        }
    }

    fn entered<R>(
        &self,
        kernel: &Kernel<'_>,
        process: ProcessId,
        f: impl FnOnce(
            &mut Counter,
            &grant_kern::grant::GrantKernelData<'_>,
        ) -> Result<R, ErrorCode>,
    ) -> Result<R, ErrorCode> {
        self.grant.enter(kernel, process, f)?
    }
}

impl SyscallDriver for Echo {
    fn command(
        &self,
        kernel: &Kernel<'_>,
        command_num: u32,
        arg1: usize,
        arg2: usize,
        process: ProcessId,
    ) -> SyscallReturn {
        match command_num {
            cmd::EXISTS => SyscallReturn::Success,
            cmd::FIRE => self
                .entered(kernel, process, |c, k| {
                    c.fired += 1;
                    c.last = arg1 as u32;
                    k.schedule_upcall(arg1, [arg2, c.fired as usize, 0])?;
                    Ok(())
                })
                .into(),
            cmd::SUM => {
                match self.entered(kernel, process, |c, k| {
                    let buf = k.get_readonly_processbuffer(0)?;
                    let sum = buf.iter().map(usize::from).sum::<usize>();
                    c.total += sum as u64;
                    Ok(sum)
                }) {
                    Ok(sum) => SyscallReturn::SuccessValue(sum),
                    Err(e) => SyscallReturn::Failure(e),
                }
            }
            cmd::FILL => {
                match self.entered(kernel, process, |_, k| {
                    let buf = k.get_readwrite_processbuffer(0)?;
                    for i in 0..buf.len() {
                        buf.set(i, arg1 as u8)?;
                    }
                    Ok(buf.len())
                }) {
                    Ok(n) => SyscallReturn::SuccessValue(n),
                    Err(e) => SyscallReturn::Failure(e),
                }
            }
            cmd::FIRED => {
                match self.entered(kernel, process, |c, _| Ok(c.fired)) {
                    Ok(n) => SyscallReturn::SuccessValue(n as usize),
                    Err(e) => SyscallReturn::Failure(e),
                }
            }
            _ => SyscallReturn::Failure(ErrorCode::NoSupport),
        }
    }

    fn allocate_grant(
        &self,
        kernel: &Kernel<'_>,
        process: ProcessId,
    ) -> Result<(), GrantError> {
        self.grant.enter(kernel, process, |_, _| ())
    }
}

pub fn ram(len: usize) -> Vec<Cell<u8>> {
    (0..len).map(|_| Cell::new(0)).collect()
}

/// Flash whose byte at offset `i` is `i as u8`.
pub fn flash() -> Vec<u8> {
    (0..FLASH_LEN).map(|i| i as u8).collect()
}

pub fn memory<'a>(ram: &'a [Cell<u8>], flash: &'a [u8]) -> ProcessMemory<'a> {
    ProcessMemory::ram_only(ram, RAM_START, APP_BRK)
        .with_flash(flash, FLASH_START)
}

/// Issues a syscall with the given argument registers, at the process width
/// `W`.
///
/// # Panics
///
/// If an argument doesn't fit `W`.
pub fn syscall<W: ProcessWord>(
    kernel: &Kernel<'_>,
    process: ProcessId,
    class: Sysnum,
    args: [u64; 4],
) -> (SavedState<W>, Outcome) {
    let mut state = SavedState::syscall(class, args.map(word::<W>));
    let outcome = kernel.handle_syscall(process, &mut state);
    (state, outcome)
}

/// Like [`syscall`], for a syscall that isn't a yield. Checks that the
/// registers decode to what the kernel says it wrote.
pub fn call<W: ProcessWord>(
    kernel: &Kernel<'_>,
    process: ProcessId,
    class: Sysnum,
    args: [u64; 4],
) -> SyscallReturn {
    let (state, outcome) = syscall::<W>(kernel, process, class, args);
    let Outcome::Returned(ret) = outcome else {
        panic!("{class:?} didn't return: {outcome:?}");
    };
    assert_eq!(state.decode_return(), Some(ret));
    ret
}

pub fn word<W: ProcessWord>(v: u64) -> W {
    W::from_u64(v).unwrap()
}
