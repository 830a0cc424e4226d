// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Each layer of the kernel has its own small error enum, and they nest by
//! way of `From` so that `?` does the plumbing. Anything that can end up in
//! front of a process converts to an [`ErrorCode`]; that conversion is the
//! only place the wire values are chosen.

use abi::ErrorCode;

/// A process-supplied descriptor failed validation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValidationError {
    /// The range wraps, isn't representable, isn't wholly inside memory the
    /// process can reach, or falls outside its capability's bounds.
    OutOfBounds,
    /// The range is the process's, but not for the access requested: a
    /// writable share of flash, or a capability lacking `LOAD`/`STORE`.
    PermissionDenied,
}

/// Failure to get at a grant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GrantError {
    /// The process id doesn't name a live process (it was terminated or
    /// restarted), or the grant doesn't exist and this operation won't create
    /// it.
    NoSuchGrant,
    /// The grant is already entered further up the stack.
    AlreadyEntered,
    /// The process's grant area or grant table is exhausted.
    OutOfGrantMemory,
    /// A grant for this driver exists with a different shape than the one
    /// being entered. Two `Grant`s were created for the same driver number.
    LayoutMismatch,
}

/// Failure to register or deliver an upcall.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpcallError {
    /// The subscribe number is beyond the slots the driver's grant reserves.
    InvalidSubscribeNum,
    /// The process already has as many pending upcalls as it can hold. The
    /// upcall was dropped and counted.
    QueueFull,
    Grant(GrantError),
}

impl From<GrantError> for UpcallError {
    fn from(e: GrantError) -> Self {
        Self::Grant(e)
    }
}

/// Reasons the dispatcher refuses a syscall before (or instead of) handing it
/// to a capsule.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchError {
    /// No capsule is registered under the driver number.
    InvalidDriver,
    /// An argument doesn't fit the kernel's native width.
    ArgumentWidth,
    /// Allow number beyond the slots the driver's grant reserves.
    NoSuchAllow,
    /// The calling process id is stale.
    NoSuchProcess,
    /// The syscall class or yield kind isn't one we know.
    Unsupported,
    Validation(ValidationError),
    Grant(GrantError),
    Upcall(UpcallError),
}

impl From<ValidationError> for DispatchError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<GrantError> for DispatchError {
    fn from(e: GrantError) -> Self {
        Self::Grant(e)
    }
}

impl From<UpcallError> for DispatchError {
    fn from(e: UpcallError) -> Self {
        match e {
            UpcallError::Grant(g) => Self::Grant(g),
            e => Self::Upcall(e),
        }
    }
}

impl From<ValidationError> for ErrorCode {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::OutOfBounds => Self::Invalid,
            ValidationError::PermissionDenied => Self::Denied,
        }
    }
}

impl From<GrantError> for ErrorCode {
    fn from(e: GrantError) -> Self {
        match e {
            GrantError::NoSuchGrant => Self::Uninstalled,
            GrantError::AlreadyEntered => Self::Busy,
            GrantError::OutOfGrantMemory => Self::NoMem,
            GrantError::LayoutMismatch => Self::Fail,
        }
    }
}

impl From<UpcallError> for ErrorCode {
    fn from(e: UpcallError) -> Self {
        match e {
            UpcallError::InvalidSubscribeNum => Self::NoSupport,
            UpcallError::QueueFull => Self::NoMem,
            UpcallError::Grant(g) => g.into(),
        }
    }
}

impl From<DispatchError> for ErrorCode {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::InvalidDriver => Self::NoDevice,
            DispatchError::ArgumentWidth => Self::Invalid,
            DispatchError::NoSuchAllow => Self::NoSupport,
            DispatchError::NoSuchProcess => Self::Fail,
            DispatchError::Unsupported => Self::NoSupport,
            DispatchError::Validation(v) => v.into(),
            DispatchError::Grant(g) => g.into(),
            DispatchError::Upcall(u) => u.into(),
        }
    }
}

/// Failure of a process lifecycle operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessError {
    /// Every process slot is occupied.
    TableFull,
    /// The process id is stale.
    NoSuchProcess,
    /// The memory handed over wraps the address space, puts the break
    /// outside RAM, or places flash on top of (or flush against) RAM.
    BadLayout,
    /// The requested application break is outside RAM or would run into
    /// grant memory.
    BadBreak,
    /// The kernel has handed out every process identifier it can.
    IdentifiersExhausted,
}

/// Failure to add a capsule to the driver table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegisterError {
    AlreadyRegistered,
    TableFull,
}
