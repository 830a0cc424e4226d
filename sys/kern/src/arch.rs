// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! The kernel never touches a trap frame directly. Instead, the trap entry
//! sequence for each architecture saves the process's registers into some
//! structure of its own and hands the dispatcher something implementing
//! [`ArchState`]. The same trait also fixes the process's word width, which
//! is how a 64-bit kernel can host 32-bit processes without the portable code
//! caring.
//!
//! Host builds get the `sim` module, a plain register file used to drive the
//! dispatcher in tests.

use abi::{
    AllowNum, CapabilityMeta, CapabilityPointerDescriptor, DriverNum,
    ProcessWord, SubscribeNum,
};

use crate::upcall::UpcallTarget;

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "none"))] {
        pub mod sim;
    }
}

/// Interface that must be implemented by the saved-register structure for
/// each architecture.
pub trait ArchState {
    /// The process's register width.
    type Word: ProcessWord;

    /// Reads the syscall class (compare against `abi::Sysnum`).
    fn syscall_class(&self) -> u32;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> Self::Word;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> Self::Word;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> Self::Word;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> Self::Word;

    /// Reads the capability metadata riding alongside argument register `n`.
    /// Always `None` on hardware without capabilities, and for a register
    /// whose capability tag is clear and bounds are null.
    fn arg_capability(&self, n: usize) -> Option<CapabilityMeta>;

    /// Writes syscall return register 0.
    fn ret0(&mut self, _: Self::Word);
    /// Writes syscall return register 1.
    fn ret1(&mut self, _: Self::Word);
    /// Writes syscall return register 2.
    fn ret2(&mut self, _: Self::Word);
    /// Writes syscall return register 3.
    fn ret3(&mut self, _: Self::Word);

    /// Writes (or clears) the capability metadata of return register `n`.
    fn ret_capability(&mut self, n: usize, _: Option<CapabilityMeta>);

    /// Arranges for the process to run `frame` when it resumes.
    fn push_upcall(&mut self, frame: UpcallFrame<Self::Word>);

    /// Interprets arguments as for the YIELD syscall and returns the results.
    fn as_yield_args(&self) -> YieldArgs {
        YieldArgs {
            kind: narrow(self.arg0()),
        }
    }

    /// Interprets arguments as for the COMMAND syscall and returns the
    /// results.
    fn as_command_args(&self) -> CommandArgs<Self::Word> {
        CommandArgs {
            driver: narrow(self.arg0()).map(DriverNum),
            command: narrow(self.arg1()),
            arg1: self.arg2(),
            arg2: self.arg3(),
        }
    }

    /// Interprets arguments as for the SUBSCRIBE syscall and returns the
    /// results.
    fn as_subscribe_args(&self) -> SubscribeArgs {
        SubscribeArgs {
            driver: narrow(self.arg0()).map(DriverNum),
            subscribe: narrow(self.arg1()).map(SubscribeNum),
            target: UpcallTarget {
                fn_ptr: self.arg2().to_u64(),
                appdata: self.arg3().to_u64(),
            },
        }
    }

    /// Interprets arguments as for either ALLOW syscall and returns the
    /// results. The descriptor's capability, if any, rides on the base
    /// register.
    fn as_allow_args(&self) -> AllowArgs<Self::Word> {
        AllowArgs {
            driver: narrow(self.arg0()).map(DriverNum),
            allow: narrow(self.arg1()).map(AllowNum),
            descriptor: CapabilityPointerDescriptor {
                base: self.arg2(),
                len: self.arg3(),
                capability: self.arg_capability(2),
            },
        }
    }
}

fn narrow<W: ProcessWord>(w: W) -> Option<u32> {
    u32::try_from(w.to_u64()).ok()
}

/// What the process finds in its registers when an upcall is delivered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UpcallFrame<W: ProcessWord> {
    pub fn_ptr: W,
    pub appdata: W,
    pub args: [W; 3],
}

/// Decoded arguments for the YIELD syscall.
#[derive(Clone, Debug)]
pub struct YieldArgs {
    /// `None` if the kind doesn't even fit in 32 bits.
    pub kind: Option<u32>,
}

/// Decoded arguments for the COMMAND syscall.
///
/// Number fields are `None` when the register held something too wide to be
/// a valid number at all.
#[derive(Clone, Debug)]
pub struct CommandArgs<W: ProcessWord> {
    pub driver: Option<DriverNum>,
    pub command: Option<u32>,
    pub arg1: W,
    pub arg2: W,
}

/// Decoded arguments for the SUBSCRIBE syscall.
#[derive(Clone, Debug)]
pub struct SubscribeArgs {
    pub driver: Option<DriverNum>,
    pub subscribe: Option<SubscribeNum>,
    pub target: UpcallTarget,
}

/// Decoded arguments for the ALLOW syscalls.
#[derive(Clone, Debug)]
pub struct AllowArgs<W: ProcessWord> {
    pub driver: Option<DriverNum>,
    pub allow: Option<AllowNum>,
    pub descriptor: CapabilityPointerDescriptor<W>,
}
