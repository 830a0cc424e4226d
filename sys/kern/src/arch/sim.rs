// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated register file for host builds.
//!
//! This stands in for a trap frame: a test fills in the syscall class and
//! argument registers, passes it to the dispatcher, and reads back what the
//! dispatcher wrote. The word type picks the simulated process width.

use abi::{
    CapabilityMeta, CapabilityPointerDescriptor, ErrorCode, ProcessWord,
    ReturnVariant, Sysnum, SyscallReturn,
};

use crate::arch::{ArchState, UpcallFrame};

#[derive(Clone, Debug, Default)]
pub struct SavedState<W: ProcessWord> {
    class: u32,
    regs: [W; 4],
    caps: [Option<CapabilityMeta>; 4],
    upcall: Option<UpcallFrame<W>>,
}

impl<W: ProcessWord> SavedState<W> {
    /// A register file set up to issue `class` with arguments `regs`.
    pub fn syscall(class: Sysnum, regs: [W; 4]) -> Self {
        Self::raw(class as u32, regs)
    }

    /// Like `syscall`, but allows class numbers the kernel doesn't know.
    pub fn raw(class: u32, regs: [W; 4]) -> Self {
        Self {
            class,
            regs,
            ..Self::default()
        }
    }

    /// Attaches capability metadata to register `n`.
    pub fn with_capability(mut self, n: usize, cap: CapabilityMeta) -> Self {
        self.caps[n] = Some(cap);
        self
    }

    pub fn regs(&self) -> [W; 4] {
        self.regs
    }

    pub fn capability(&self, n: usize) -> Option<CapabilityMeta> {
        self.caps[n]
    }

    /// Removes and returns the most recently delivered upcall, if any.
    pub fn take_upcall(&mut self) -> Option<UpcallFrame<W>> {
        self.upcall.take()
    }

    /// Decodes the return registers the way a userspace library would.
    ///
    /// Returns `None` if they don't hold a well-formed return.
    pub fn decode_return(&self) -> Option<SyscallReturn> {
        let [r0, r1, r2, _] = self.regs;
        let word = |w: W| w.to_usize();
        let code = |w: W| {
            u32::try_from(w.to_u64())
                .ok()
                .and_then(|c| ErrorCode::try_from(c).ok())
        };
        let variant =
            ReturnVariant::try_from(u32::try_from(r0.to_u64()).ok()?).ok()?;
        Some(match variant {
            ReturnVariant::Failure => SyscallReturn::Failure(code(r1)?),
            ReturnVariant::FailureValue => {
                SyscallReturn::FailureValue(code(r1)?, word(r2)?)
            }
            ReturnVariant::Success => SyscallReturn::Success,
            ReturnVariant::SuccessValue => {
                SyscallReturn::SuccessValue(word(r1)?)
            }
            ReturnVariant::SuccessPair => {
                SyscallReturn::SuccessPair(word(r1)?, word(r2)?)
            }
            ReturnVariant::SuccessDescriptor => {
                SyscallReturn::SuccessDescriptor(CapabilityPointerDescriptor {
                    base: word(r1)?,
                    len: word(r2)?,
                    capability: self.caps[1],
                })
            }
        })
    }
}

impl<W: ProcessWord> ArchState for SavedState<W> {
    type Word = W;

    fn syscall_class(&self) -> u32 {
        self.class
    }

    fn arg0(&self) -> W {
        self.regs[0]
    }
    fn arg1(&self) -> W {
        self.regs[1]
    }
    fn arg2(&self) -> W {
        self.regs[2]
    }
    fn arg3(&self) -> W {
        self.regs[3]
    }

    fn arg_capability(&self, n: usize) -> Option<CapabilityMeta> {
        self.caps.get(n).copied().flatten()
    }

    fn ret0(&mut self, x: W) {
        self.regs[0] = x;
    }
    fn ret1(&mut self, x: W) {
        self.regs[1] = x;
    }
    fn ret2(&mut self, x: W) {
        self.regs[2] = x;
    }
    fn ret3(&mut self, x: W) {
        self.regs[3] = x;
    }

    fn ret_capability(&mut self, n: usize, cap: Option<CapabilityMeta>) {
        if let Some(slot) = self.caps.get_mut(n) {
            *slot = cap;
        }
    }

    fn push_upcall(&mut self, frame: UpcallFrame<W>) {
        self.upcall = Some(frame);
    }
}
