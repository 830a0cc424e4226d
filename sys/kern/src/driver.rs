// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capsule contract, and the table the dispatcher routes through.

use abi::{DriverNum, ErrorCode, ProcessId, SyscallReturn};
use heapless::Vec;

use crate::config::MAX_DRIVERS;
use crate::err::{GrantError, RegisterError};
use crate::kernel::Kernel;

/// Interface every capsule reachable from userspace implements.
///
/// Capsules keep all per-process state in a [`crate::grant::Grant`]. They
/// never see raw registers: arguments arrive at kernel width, and outcomes go
/// back as a [`SyscallReturn`] that the dispatcher encodes for the process.
pub trait SyscallDriver {
    /// Handles a COMMAND syscall.
    ///
    /// Command 0 is conventionally an existence check that returns `Success`.
    /// The default implementation supports nothing, not even that.
    fn command(
        &self,
        kernel: &Kernel<'_>,
        command_num: u32,
        arg1: usize,
        arg2: usize,
        process: ProcessId,
    ) -> SyscallReturn {
        let _ = (kernel, command_num, arg1, arg2, process);
        SyscallReturn::Failure(ErrorCode::NoSupport)
    }

    /// Makes sure the capsule's grant exists in `process`.
    ///
    /// The kernel calls this before servicing subscribe or allow for a
    /// process that has never touched the capsule, because only the capsule
    /// knows the grant's type. Entering the grant with a no-op closure is
    /// enough.
    fn allocate_grant(
        &self,
        kernel: &Kernel<'_>,
        process: ProcessId,
    ) -> Result<(), GrantError>;
}

/// Registered capsules, by driver number.
pub struct DriverTable<'a> {
    entries: Vec<(DriverNum, &'a dyn SyscallDriver), MAX_DRIVERS>,
}

impl<'a> DriverTable<'a> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        num: DriverNum,
        driver: &'a dyn SyscallDriver,
    ) -> Result<(), RegisterError> {
        if self.get(num).is_some() {
            return Err(RegisterError::AlreadyRegistered);
        }
        self.entries
            .push((num, driver))
            .map_err(|_| RegisterError::TableFull)
    }

    pub fn get(&self, num: DriverNum) -> Option<&'a dyn SyscallDriver> {
        self.entries
            .iter()
            .find(|(n, _)| *n == num)
            .map(|&(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DriverTable<'_> {
    fn default() -> Self {
        Self::new()
    }
}
