// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! This builds on architecture-specific parts defined in the `arch::*`
//! modules.
//!
//! # Syscall implementations
//!
//! With the exception of yield, syscalls are implemented by functions with
//! the signature:
//!
//! ```ignore
//! fn syscall(&self, process: &Process, state: &S)
//!     -> Result<SyscallReturn, DispatchError>;
//! ```
//!
//! `process` is the (live) caller. `Ok` carries whatever the capsule, or the
//! kernel on its behalf, decided the outcome was; `Err` is a refusal by the
//! kernel itself. A common wrapper turns either into return registers at the
//! process's width, so no syscall deals in register values.
//!
//! Arguments are read through the *argument proxies* on
//! [`ArchState`](crate::arch::ArchState), e.g. `state.as_allow_args()`.
//!
//! # Ordering
//!
//! Everything the kernel can check without a capsule is checked before any
//! capsule code runs: the driver must be registered, and a descriptor must
//! validate. Only then is the capsule asked to create its grant, if the
//! process hasn't got one.

use abi::{
    CapabilityMeta, CapabilityPointerDescriptor, DriverNum, ErrorCode,
    ProcessId, ProcessWord, ReturnVariant, Sysnum, SyscallReturn,
    YIELD_NO_WAIT,
};
use ringbuf::ringbuf_entry;

use crate::arch::ArchState;
use crate::driver::SyscallDriver;
use crate::err::{DispatchError, UpcallError};
use crate::grant::{self, AllowKind, GrantKernelData};
use crate::kernel::{Kernel, Trace};
use crate::process::Process;
use crate::umem::{validate, Access};

/// What became of a syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The return registers hold this (see `abi::ReturnVariant`).
    Returned(SyscallReturn),
    /// A no-wait yield. r0 is 1 if an upcall was pushed into the process's
    /// saved state, 0 if none was pending.
    Yielded { delivered: bool },
}

impl Kernel<'_> {
    /// Entry point accessed by the arch-specific syscall entry sequence.
    ///
    /// `state` holds the saved registers of `process`, which issued the
    /// syscall. On return the return registers (and, after a yield, the
    /// upcall frame) have been written; what was written is also returned for
    /// the benefit of the caller's bookkeeping.
    ///
    /// This never panics, whatever is in `state`.
    pub fn handle_syscall<S: ArchState>(
        &self,
        process: ProcessId,
        state: &mut S,
    ) -> Outcome {
        let class = state.syscall_class();
        ringbuf_entry!(self.trace_mut(), Trace::Syscall { process, class });

        let Some(p) = self.process(process) else {
            ringbuf_entry!(self.trace_mut(), Trace::StaleProcess(process));
            let r = encode(
                state,
                SyscallReturn::Failure(DispatchError::NoSuchProcess.into()),
            );
            return self.returned(process, r);
        };

        let res = match Sysnum::try_from(class) {
            Ok(Sysnum::Yield) => match self.sys_yield(p, state) {
                Ok(delivered) => {
                    state.ret0(S::Word::from_u32(u32::from(delivered)));
                    return Outcome::Yielded { delivered };
                }
                Err(e) => Err(e),
            },
            Ok(Sysnum::Subscribe) => self.sys_subscribe(p, state),
            Ok(Sysnum::Command) => self.sys_command(p, state),
            Ok(Sysnum::AllowReadWrite) => {
                self.sys_allow(p, state, AllowKind::ReadWrite)
            }
            Ok(Sysnum::AllowReadOnly) => {
                self.sys_allow(p, state, AllowKind::ReadOnly)
            }
            Err(_) => Err(DispatchError::Unsupported),
        };
        let ret = res.unwrap_or_else(|e| SyscallReturn::Failure(e.into()));
        let r = encode(state, ret);
        self.returned(process, r)
    }

    fn returned(&self, process: ProcessId, ret: SyscallReturn) -> Outcome {
        ringbuf_entry!(
            self.trace_mut(),
            Trace::Returned {
                process,
                variant: ret.variant(),
            }
        );
        Outcome::Returned(ret)
    }

    /// Looks up the capsule a syscall is addressed to.
    fn route(
        &self,
        driver: Option<DriverNum>,
    ) -> Result<(DriverNum, &dyn SyscallDriver), DispatchError> {
        let num = driver.ok_or(DispatchError::InvalidDriver)?;
        let d = self.driver(num).ok_or(DispatchError::InvalidDriver)?;
        Ok((num, d))
    }

    /// Has `driver` create its grant in `process` if it hasn't yet.
    fn ensure_grant(
        &self,
        num: DriverNum,
        driver: &dyn SyscallDriver,
        process: &Process<'_>,
    ) -> Result<(), DispatchError> {
        if !process.has_grant(num) {
            driver.allocate_grant(self, process.id())?;
        }
        Ok(())
    }

    /// Implementation of the no-wait YIELD syscall. Returns whether an upcall
    /// was delivered.
    fn sys_yield<S: ArchState>(
        &self,
        process: &Process<'_>,
        state: &mut S,
    ) -> Result<bool, DispatchError> {
        if state.as_yield_args().kind != Some(YIELD_NO_WAIT) {
            return Err(DispatchError::Unsupported);
        }

        while let Some(upcall) = process.dequeue_upcall() {
            if let Some(frame) = upcall.frame::<S::Word>() {
                state.push_upcall(frame);
                ringbuf_entry!(
                    self.trace_mut(),
                    Trace::UpcallDelivered(process.id(), upcall.id)
                );
                return Ok(true);
            }
            // Doesn't fit the process's registers.
            process.count_dropped_upcall();
            ringbuf_entry!(
                self.trace_mut(),
                Trace::UpcallDropped(process.id(), upcall.id)
            );
        }
        Ok(false)
    }

    /// Implementation of the SUBSCRIBE syscall. Success returns the replaced
    /// target as a pair, (0, 0) if there wasn't one.
    fn sys_subscribe<S: ArchState>(
        &self,
        process: &Process<'_>,
        state: &S,
    ) -> Result<SyscallReturn, DispatchError> {
        let args = state.as_subscribe_args();
        let (num, driver) = self.route(args.driver)?;
        let subscribe =
            args.subscribe.ok_or(UpcallError::InvalidSubscribeNum)?;
        self.ensure_grant(num, driver, process)?;

        // The reply is settled before the slot changes: a process that
        // can't be told what it replaced keeps what it had.
        let slot = subscribe.0 as usize;
        let previous =
            grant::enter_kernel_managed(self, num, process.id(), |kdata| {
                kdata.upcall(slot)
            })??;
        let previous = Some(previous)
            .filter(|t| !t.is_null())
            .unwrap_or_default();
        let Some(reply) = usize::try_from(previous.fn_ptr)
            .ok()
            .zip(usize::try_from(previous.appdata).ok())
            .map(|(f, d)| SyscallReturn::SuccessPair(f, d))
            .filter(fits::<S::Word>)
        else {
            return Ok(SyscallReturn::Failure(ErrorCode::Size));
        };

        self.subscribe(num, process.id(), subscribe, args.target)?;
        Ok(reply)
    }

    /// Implementation of the COMMAND syscall.
    fn sys_command<S: ArchState>(
        &self,
        process: &Process<'_>,
        state: &S,
    ) -> Result<SyscallReturn, DispatchError> {
        let args = state.as_command_args();
        let (_, driver) = self.route(args.driver)?;
        let command = args.command.ok_or(DispatchError::Unsupported)?;
        let arg1 = args.arg1.to_usize().ok_or(DispatchError::ArgumentWidth)?;
        let arg2 = args.arg2.to_usize().ok_or(DispatchError::ArgumentWidth)?;
        Ok(driver.command(self, command, arg1, arg2, process.id()))
    }

    /// Implementation of both ALLOW syscalls. Success returns the descriptor
    /// the new one replaced.
    fn sys_allow<S: ArchState>(
        &self,
        process: &Process<'_>,
        state: &S,
        kind: AllowKind,
    ) -> Result<SyscallReturn, DispatchError> {
        let args = state.as_allow_args();
        let (num, driver) = self.route(args.driver)?;
        let access = match kind {
            AllowKind::ReadOnly => Access::Read,
            AllowKind::ReadWrite => Access::ReadWrite,
        };
        validate(&args.descriptor, process, access)?;
        let slot = args.allow.ok_or(DispatchError::NoSuchAllow)?.0 as usize;
        self.ensure_grant(num, driver, process)?;

        let d = &args.descriptor;
        let stored = CapabilityPointerDescriptor {
            base: d.base.to_u64(),
            len: d.len.to_u64(),
            capability: d.capability,
        };
        let reply = |kdata: &GrantKernelData<'_>| -> Result<_, DispatchError> {
            let Some(reply) = kdata
                .allow(kind, slot)?
                .convert::<usize>()
                .map(SyscallReturn::SuccessDescriptor)
                .filter(fits::<S::Word>)
            else {
                return Ok(SyscallReturn::Failure(ErrorCode::Size));
            };
            kdata.set_allow(kind, slot, &stored)?;
            Ok(reply)
        };
        grant::enter_kernel_managed(self, num, process.id(), reply)?
    }
}

/// Register values for `ret` at width `W`, or `None` if its payload doesn't
/// fit.
fn registers<W: ProcessWord>(
    ret: &SyscallReturn,
) -> Option<([W; 4], Option<CapabilityMeta>)> {
    let zero = W::default();
    let tag = W::from_u32(ret.variant() as u32);
    let code = |e: ErrorCode| W::from_u32(u32::from(e));
    let word = W::from_usize;
    Some(match *ret {
        SyscallReturn::Failure(e) => ([tag, code(e), zero, zero], None),
        SyscallReturn::FailureValue(e, v) => {
            ([tag, code(e), word(v)?, zero], None)
        }
        SyscallReturn::Success => ([tag, zero, zero, zero], None),
        SyscallReturn::SuccessValue(v) => ([tag, word(v)?, zero, zero], None),
        SyscallReturn::SuccessPair(a, b) => {
            ([tag, word(a)?, word(b)?, zero], None)
        }
        SyscallReturn::SuccessDescriptor(d) => {
            ([tag, word(d.base)?, word(d.len)?, zero], d.capability)
        }
    })
}

/// Whether `ret` can be written at width `W` as it stands.
fn fits<W: ProcessWord>(ret: &SyscallReturn) -> bool {
    registers::<W>(ret).is_some()
}

/// Writes `ret` into the return registers, returning what was actually
/// written: a return whose payload doesn't fit the process's width becomes
/// `Failure(Size)`.
fn encode<S: ArchState>(state: &mut S, ret: SyscallReturn) -> SyscallReturn {
    let (ret, ([r0, r1, r2, r3], cap)) = match registers::<S::Word>(&ret) {
        Some(regs) => (ret, regs),
        None => {
            let zero = S::Word::default();
            let regs = [
                S::Word::from_u32(ReturnVariant::Failure as u32),
                S::Word::from_u32(u32::from(ErrorCode::Size)),
                zero,
                zero,
            ];
            (SyscallReturn::Failure(ErrorCode::Size), (regs, None))
        }
    };
    state.ret0(r0);
    state.ret1(r1);
    state.ret2(r2);
    state.ret3(r3);
    state.ret_capability(1, cap);
    ret
}
