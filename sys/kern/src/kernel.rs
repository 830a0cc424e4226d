// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel object: process table, driver table, and trace.
//!
//! Everything the dispatcher and capsules do goes through a shared
//! `&Kernel`. Only lifecycle operations (registering drivers, creating,
//! terminating and restarting processes) need `&mut`, which keeps them from
//! racing with an entered grant.

use core::cell::{Ref, RefCell, RefMut};

use abi::{DriverNum, ProcessId, ReturnVariant};
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::config::{MAX_PROCESSES, TRACE_DEPTH};
use crate::driver::{DriverTable, SyscallDriver};
use crate::err::{GrantError, ProcessError, RegisterError};
use crate::process::{Process, ProcessMemory};
use crate::upcall::UpcallId;

/// Kernel events, recorded in a small in-memory ring for post-mortem
/// inspection.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    Syscall {
        process: ProcessId,
        class: u32,
    },
    Returned {
        process: ProcessId,
        variant: ReturnVariant,
    },
    GrantAllocated {
        process: ProcessId,
        driver: DriverNum,
        size: usize,
    },
    GrantRefused {
        process: ProcessId,
        driver: DriverNum,
        error: GrantError,
    },
    UpcallQueued(ProcessId, UpcallId),
    UpcallDropped(ProcessId, UpcallId),
    UpcallUnregistered(ProcessId, UpcallId),
    UpcallDelivered(ProcessId, UpcallId),
    StaleProcess(ProcessId),
    ProcessCreated(ProcessId),
    ProcessTerminated(ProcessId),
    ProcessRestarted {
        old: ProcessId,
        new: ProcessId,
    },
}

pub type TraceBuf = Ringbuf<Trace, TRACE_DEPTH>;

pub struct Kernel<'a> {
    processes: [Option<Process<'a>>; MAX_PROCESSES],
    /// Identifier handed to the next process created or restarted.
    next_identifier: u32,
    drivers: DriverTable<'a>,
    trace: RefCell<TraceBuf>,
}

impl<'a> Kernel<'a> {
    pub fn new() -> Self {
        Self {
            processes: core::array::from_fn(|_| None),
            next_identifier: 0,
            drivers: DriverTable::new(),
            trace: RefCell::new(Ringbuf::new(Trace::None)),
        }
    }

    /// Makes `driver` reachable from userspace as driver number `num`.
    pub fn register_driver(
        &mut self,
        num: DriverNum,
        driver: &'a dyn SyscallDriver,
    ) -> Result<(), RegisterError> {
        self.drivers.register(num, driver)
    }

    pub fn driver(&self, num: DriverNum) -> Option<&'a dyn SyscallDriver> {
        self.drivers.get(num)
    }

    fn fresh_identifier(&mut self) -> Result<u32, ProcessError> {
        let id = self.next_identifier;
        self.next_identifier = id
            .checked_add(1)
            .ok_or(ProcessError::IdentifiersExhausted)?;
        Ok(id)
    }

    /// Installs a process in the first free slot.
    pub fn create_process(
        &mut self,
        memory: ProcessMemory<'a>,
    ) -> Result<ProcessId, ProcessError> {
        memory.check()?;
        let index = self
            .processes
            .iter()
            .position(Option::is_none)
            .ok_or(ProcessError::TableFull)?;
        let id = ProcessId::new(index, self.fresh_identifier()?);
        self.processes[index] = Some(Process::new(id, memory));
        ringbuf_entry!(self.trace.get_mut(), Trace::ProcessCreated(id));
        Ok(id)
    }

    /// Removes a process, giving back the memory it was created with. Its
    /// grants, registrations, and pending upcalls are gone, and `process`
    /// is stale from here on.
    pub fn terminate(
        &mut self,
        process: ProcessId,
    ) -> Result<ProcessMemory<'a>, ProcessError> {
        self.process(process).ok_or(ProcessError::NoSuchProcess)?;
        let p = self.processes[process.index()]
            .take()
            .ok_or(ProcessError::NoSuchProcess)?;
        ringbuf_entry!(self.trace.get_mut(), Trace::ProcessTerminated(process));
        Ok(p.memory())
    }

    /// Restarts a process in place: same slot and memory, fresh state, new
    /// identifier. Every grant is reclaimed, and anything holding the old id
    /// finds it stale.
    pub fn restart(
        &mut self,
        process: ProcessId,
    ) -> Result<ProcessId, ProcessError> {
        let memory = self
            .process(process)
            .ok_or(ProcessError::NoSuchProcess)?
            .memory();
        let new = ProcessId::new(process.index(), self.fresh_identifier()?);
        self.processes[process.index()] = Some(Process::new(new, memory));
        ringbuf_entry!(
            self.trace.get_mut(),
            Trace::ProcessRestarted { old: process, new }
        );
        Ok(new)
    }

    /// Moves `process`'s application break, as for a `brk`-style memop.
    pub fn set_app_break(
        &self,
        process: ProcessId,
        brk: usize,
    ) -> Result<(), ProcessError> {
        self.process(process)
            .ok_or(ProcessError::NoSuchProcess)?
            .set_app_break(brk)
    }

    /// Looks up a live process. `None` if the id is stale.
    pub fn process(&self, id: ProcessId) -> Option<&Process<'a>> {
        self.processes
            .get(id.index())?
            .as_ref()
            .filter(|p| p.id() == id)
    }

    /// Iterates over every live process, in slot order.
    pub fn processes(&self) -> impl Iterator<Item = &Process<'a>> + '_ {
        self.processes.iter().flatten()
    }

    /// The kernel's event trace.
    ///
    /// # Panics
    ///
    /// If called from inside a trace update, which nothing does.
    pub fn trace(&self) -> Ref<'_, TraceBuf> {
        self.trace.borrow()
    }

    pub(crate) fn trace_mut(&self) -> RefMut<'_, TraceBuf> {
        self.trace.borrow_mut()
    }
}

impl Default for Kernel<'_> {
    fn default() -> Self {
        Self::new()
    }
}
