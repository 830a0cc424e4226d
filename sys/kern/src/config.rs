// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time kernel sizing.
//!
//! These are generated from the `KERN_CONFIG` environment variable by
//! `build.rs`:
//!
//! - `MAX_PROCESSES`: slots in the process table.
//! - `GRANTS_PER_PROCESS`: distinct capsules that can hold a grant in any one
//!   process.
//! - `MAX_DRIVERS`: capacity of the driver table.
//! - `UPCALL_QUEUE_LEN`: pending upcalls each process can have outstanding.
//! - `TRACE_DEPTH`: entries in the kernel's trace buffer.
//! - `MAX_ALLOW_LEN`: if set, the longest buffer a process may share.

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));
