// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Grant kernel.
//!
//! This is the syscall boundary of a kernel that hosts mutually untrusting
//! processes alongside kernel-resident drivers ("capsules") on parts without an
//! MMU. It covers four things:
//!
//! - Grants: capsule-private, per-process storage carved out of the top of
//!   each process's own memory, so capsules never need a global allocator or
//!   a fixed-size array of per-process state.
//! - Upcalls: at most one registered notification target per (capsule,
//!   process, slot), kept inside the owning grant.
//! - Descriptors: base/length pairs from a process, carried at the process's
//!   word width and validated against its memory map (and capability bounds,
//!   where the hardware has them) on every use.
//! - Returns: a closed set of result variants that only the dispatcher turns
//!   into register values.
//!
//! Board bring-up, the process loader, scheduling, and the trap entry
//! sequence are somebody else's problem. They reach this crate through
//! [`kernel::Kernel`] and the [`arch::ArchState`] trait.
//!
//! # Design principles
//!
//! 1. Static configuration. Table sizes are fixed at build time (see
//!    `build.rs`).
//! 2. Nothing blocks. Every operation succeeds or fails immediately, which is
//!    why re-entering a grant is an error rather than a wait.
//! 3. A strong preference for safe code. Process memory is only ever touched
//!    through `Cell<u8>` slices, and grant contents are copied in and out with
//!    `zerocopy`.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.

#![cfg_attr(target_os = "none", no_std)]
#![forbid(unsafe_code)]

pub mod arch;

pub mod config;
pub mod driver;
pub mod err;
pub mod grant;
pub mod kernel;
pub mod process;
pub mod syscalls;
pub mod umem;
pub mod upcall;
