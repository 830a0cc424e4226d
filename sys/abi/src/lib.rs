// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall ABI definitions, shared between the kernel, capsules and
//! applications.
//!
//! Everything in here is described in terms of what a process can observe:
//! the numbers it puts in registers to ask for things, the numbers it gets
//! back, and the shapes of the pointer/length pairs it hands the kernel. The
//! kernel's internal representations live elsewhere.

#![cfg_attr(not(test), no_std)]

use core::fmt::Debug;

use num_traits::{PrimInt, Unsigned};
use serde::{Deserialize, Serialize};

/// Names a capsule, as seen across the syscall boundary.
///
/// Driver numbers are assigned when a board registers its capsules and are
/// stable for the life of the kernel image.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct DriverNum(pub u32);

/// Names one notification slot within a driver, e.g. "read done".
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct SubscribeNum(pub u32);

/// Names one buffer slot within a driver. Read-only and read-write allows
/// have separate numbering.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct AllowNum(pub u32);

/// Names a particular incarnation of a process.
///
/// A `ProcessId` combines the process's slot in the kernel's process table
/// (`index`) with an `identifier` drawn from a kernel-wide counter that is
/// never reused. Restarting a process keeps the slot but hands out a fresh
/// identifier, so anything still holding the old `ProcessId` -- a capsule
/// with a pending operation, say -- finds that it no longer refers to
/// anything, rather than silently reattaching to the new incarnation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    index: u16,
    identifier: u32,
}

impl ProcessId {
    /// Fabricates a `ProcessId`. Only the kernel's process table should do
    /// this; an id made up anywhere else will simply fail to resolve.
    pub const fn new(index: usize, identifier: u32) -> Self {
        Self {
            index: index as u16,
            identifier,
        }
    }

    /// Extracts the process table slot.
    pub fn index(&self) -> usize {
        usize::from(self.index)
    }

    /// Extracts the incarnation identifier.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }
}

/// Enumeration of syscall classes.
///
/// The class is carried in the syscall instruction's immediate (or a
/// dedicated register, depending on the architecture), separately from the
/// four argument registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Sysnum {
    Yield = 0,
    Subscribe = 1,
    Command = 2,
    AllowReadWrite = 3,
    AllowReadOnly = 4,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-derive` and this seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Yield),
            1 => Ok(Self::Subscribe),
            2 => Ok(Self::Command),
            3 => Ok(Self::AllowReadWrite),
            4 => Ok(Self::AllowReadOnly),
            _ => Err(()),
        }
    }
}

/// Value of the first `Yield` argument asking the kernel to deliver a
/// pending upcall if there is one, and return immediately either way.
pub const YIELD_NO_WAIT: u32 = 0;

/// Error codes a process can receive from a failed syscall.
///
/// This is a closed set. Capsules that need to report something more
/// specific use the `FailureValue` return variant to attach a number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    /// Generic failure condition.
    Fail = 1,
    /// Underlying system is busy; retry.
    Busy = 2,
    /// The state requested is already set.
    Already = 3,
    /// The component is powered down.
    Off = 4,
    /// Reservation required before use.
    Reserve = 5,
    /// An invalid parameter was passed, including a buffer the process does
    /// not own.
    Invalid = 6,
    /// Parameter passed was too large.
    Size = 7,
    /// Operation cancelled by a call.
    Cancel = 8,
    /// Memory required not available.
    NoMem = 9,
    /// Operation is not supported.
    NoSupport = 10,
    /// Device does not exist; for syscalls, the driver number isn't
    /// registered.
    NoDevice = 11,
    /// Device is not physically installed, or the caller's state for it was
    /// torn down.
    Uninstalled = 12,
    /// Packet transmission not acknowledged.
    NoAck = 13,
    /// A hardware capability was valid but did not confer the access
    /// requested.
    Denied = 14,
}

impl core::convert::TryFrom<u32> for ErrorCode {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Fail),
            2 => Ok(Self::Busy),
            3 => Ok(Self::Already),
            4 => Ok(Self::Off),
            5 => Ok(Self::Reserve),
            6 => Ok(Self::Invalid),
            7 => Ok(Self::Size),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::NoMem),
            10 => Ok(Self::NoSupport),
            11 => Ok(Self::NoDevice),
            12 => Ok(Self::Uninstalled),
            13 => Ok(Self::NoAck),
            14 => Ok(Self::Denied),
            _ => Err(()),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(e: ErrorCode) -> Self {
        e as u32
    }
}

/// Tag placed in the first return register, identifying which
/// `SyscallReturn` variant the remaining registers hold.
///
/// Failures live below 128 and successes at or above it, so a process can
/// test success with a single comparison.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ReturnVariant {
    Failure = 0,
    FailureValue = 1,
    Success = 128,
    SuccessValue = 129,
    SuccessPair = 130,
    SuccessDescriptor = 134,
}

impl core::convert::TryFrom<u32> for ReturnVariant {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Failure),
            1 => Ok(Self::FailureValue),
            128 => Ok(Self::Success),
            129 => Ok(Self::SuccessValue),
            130 => Ok(Self::SuccessPair),
            134 => Ok(Self::SuccessDescriptor),
            _ => Err(()),
        }
    }
}

/// Outcome of a syscall.
///
/// Every capsule operation produces exactly one of these; there is no other
/// way to report an outcome, and in particular no way to report "failure,
/// but pretend it worked." Scalar payloads are kernel-width here; the
/// dispatcher converts them to the calling process's width when it writes
/// the return registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallReturn {
    Success,
    SuccessValue(usize),
    SuccessPair(usize, usize),
    SuccessDescriptor(CapabilityPointerDescriptor<usize>),
    Failure(ErrorCode),
    FailureValue(ErrorCode, usize),
}

impl SyscallReturn {
    /// Returns the tag that identifies this variant on the wire.
    pub fn variant(&self) -> ReturnVariant {
        match self {
            Self::Success => ReturnVariant::Success,
            Self::SuccessValue(_) => ReturnVariant::SuccessValue,
            Self::SuccessPair(..) => ReturnVariant::SuccessPair,
            Self::SuccessDescriptor(_) => ReturnVariant::SuccessDescriptor,
            Self::Failure(_) => ReturnVariant::Failure,
            Self::FailureValue(..) => ReturnVariant::FailureValue,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failure(_) | Self::FailureValue(..))
    }
}

/// Convenience for capsules whose operation either works or fails with a
/// code.
impl From<Result<(), ErrorCode>> for SyscallReturn {
    fn from(r: Result<(), ErrorCode>) -> Self {
        match r {
            Ok(()) => Self::Success,
            Err(e) => Self::Failure(e),
        }
    }
}

/// An unsigned integer the width of some process's registers.
///
/// The kernel may host processes narrower than itself (a 64-bit kernel
/// running 32-bit processes, for instance). Everything that crosses the
/// syscall boundary is carried at the process's width and converted by the
/// dispatcher; the conversions here fail rather than truncate.
pub trait ProcessWord:
    PrimInt + Unsigned + Debug + Default + Send + Sync + 'static
{
    /// Converts to the kernel's native width, if representable.
    fn to_usize(self) -> Option<usize>;

    /// Converts from the kernel's native width, if representable.
    fn from_usize(v: usize) -> Option<Self>;

    /// Widens losslessly; no supported process word is wider than 64 bits.
    fn to_u64(self) -> u64;

    /// Narrows from `u64`, if representable.
    fn from_u64(v: u64) -> Option<Self>;

    /// Every supported process word is at least 32 bits wide.
    fn from_u32(v: u32) -> Self;
}

macro_rules! impl_process_word {
    ($($t:ty),*) => {
        $(
            impl ProcessWord for $t {
                fn to_usize(self) -> Option<usize> {
                    usize::try_from(self).ok()
                }

                fn from_usize(v: usize) -> Option<Self> {
                    <$t>::try_from(v).ok()
                }

                fn to_u64(self) -> u64 {
                    self as u64
                }

                fn from_u64(v: u64) -> Option<Self> {
                    <$t>::try_from(v).ok()
                }

                fn from_u32(v: u32) -> Self {
                    v as $t
                }
            }
        )*
    };
}

impl_process_word!(u32, u64, usize);

bitflags::bitflags! {
    /// Permission bits carried by a hardware memory capability.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct CapPerms: u32 {
        const GLOBAL = 1 << 0;
        const EXECUTE = 1 << 1;
        const LOAD = 1 << 2;
        const STORE = 1 << 3;
        const LOAD_CAP = 1 << 4;
        const STORE_CAP = 1 << 5;
        const STORE_CAP_LOCAL = 1 << 6;
        const SEAL = 1 << 7;
        const CINVOKE = 1 << 8;
        const UNSEAL = 1 << 9;
        const ACCESS_SYS = 1 << 10;
        const SET_CID = 1 << 11;

        /// What a process normally holds for its own RAM.
        const DEFAULT_RW = Self::LOAD.bits()
            | Self::STORE.bits()
            | Self::LOAD_CAP.bits()
            | Self::STORE_CAP.bits()
            | Self::GLOBAL.bits()
            | Self::STORE_CAP_LOCAL.bits();
        /// What a process normally holds for read-only data.
        const DEFAULT_R = Self::LOAD.bits()
            | Self::LOAD_CAP.bits()
            | Self::GLOBAL.bits()
            | Self::STORE_CAP_LOCAL.bits();
    }
}

/// Hardware capability metadata riding alongside a pointer, on platforms
/// that have it.
///
/// The bounds here are the capability's own, which may be wider than the
/// `base`/`len` the process is claiming in the same syscall; the kernel
/// checks that the claim fits inside them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CapabilityMeta {
    /// Hardware validity tag. A cleared tag means the register held plain
    /// data, not an authority.
    pub tag: bool,
    pub base: u64,
    pub length: u64,
    pub perms: CapPerms,
}

impl CapabilityMeta {
    /// A capability over `[base, base + length)` with `perms`, tag set.
    pub const fn new(base: u64, length: u64, perms: CapPerms) -> Self {
        Self {
            tag: true,
            base,
            length,
            perms,
        }
    }

    /// Checks that `[base, base + len)` lies within this capability's
    /// bounds. Says nothing about the tag or permissions.
    pub fn covers(&self, base: u64, len: u64) -> bool {
        let (Some(end), Some(cap_end)) =
            (base.checked_add(len), self.base.checked_add(self.length))
        else {
            return false;
        };
        self.base <= base && end <= cap_end
    }

    /// Checks that every bit in `required` is granted.
    pub fn permits(&self, required: CapPerms) -> bool {
        self.perms.contains(required)
    }
}

/// A process's claim about a region of its memory: a base address and a
/// length, at the process's word width, optionally carrying hardware
/// capability metadata.
///
/// Having one of these tells you nothing about whether the process actually
/// owns that memory. It is only meaningful in the context of the process that
/// produced it, and the kernel revalidates it against that process's memory
/// every time it is used.
///
/// A zero-length descriptor means "no buffer", whatever its base.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CapabilityPointerDescriptor<W: ProcessWord> {
    pub base: W,
    pub len: W,
    pub capability: Option<CapabilityMeta>,
}

impl<W: ProcessWord> CapabilityPointerDescriptor<W> {
    pub fn new(base: W, len: W) -> Self {
        Self {
            base,
            len,
            capability: None,
        }
    }

    /// The "no buffer" descriptor.
    pub fn null() -> Self {
        Self::new(W::zero(), W::zero())
    }

    pub fn with_capability(self, capability: CapabilityMeta) -> Self {
        Self {
            capability: Some(capability),
            ..self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len.is_zero()
    }

    /// Address one past the last byte, computed at the process's width.
    /// `None` if the range wraps around the process's address space.
    pub fn checked_end(&self) -> Option<W> {
        self.base.checked_add(&self.len)
    }

    /// Converts to another width (usually: process width to kernel width or
    /// back), failing if either field is not representable.
    pub fn convert<V: ProcessWord>(
        &self,
    ) -> Option<CapabilityPointerDescriptor<V>> {
        Some(CapabilityPointerDescriptor {
            base: V::from_usize(self.base.to_usize()?)?,
            len: V::from_usize(self.len.to_usize()?)?,
            capability: self.capability,
        })
    }
}
