// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upcalls: notifications from capsules to processes.
//!
//! A process registers a function pointer and an opaque word (`appdata`)
//! against a (driver, subscribe number) pair. The registration lives in the
//! driver's grant for that process, one slot per subscribe number, so there
//! can never be more than one target per triple. When the capsule fires the
//! slot, the kernel queues a [`PendingUpcall`] on the process; the process
//! collects it by yielding.
//!
//! Replacing a registration also throws away anything already queued for
//! that slot. Otherwise a process that re-subscribes with a new handler
//! could still be called into the old one.

use abi::{DriverNum, ProcessId, ProcessWord, SubscribeNum};
use ringbuf::ringbuf_entry;

use crate::arch::UpcallFrame;
use crate::err::UpcallError;
use crate::grant::{self, GrantRegion};
use crate::kernel::{Kernel, Trace};
use crate::process::Process;

/// Where to deliver an upcall in the process.
///
/// Stored at 64 bits regardless of the process's width so that the grant
/// layout doesn't depend on it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct UpcallTarget {
    pub fn_ptr: u64,
    pub appdata: u64,
}

impl UpcallTarget {
    /// The "nobody is listening" target.
    pub const NULL: Self = Self {
        fn_ptr: 0,
        appdata: 0,
    };

    pub fn new(fn_ptr: u64, appdata: u64) -> Self {
        Self { fn_ptr, appdata }
    }

    pub fn is_null(&self) -> bool {
        self.fn_ptr == 0
    }
}

/// Names an upcall slot within a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UpcallId {
    pub driver: DriverNum,
    pub subscribe: SubscribeNum,
}

/// An upcall that has fired but not yet been delivered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PendingUpcall {
    pub id: UpcallId,
    pub target: UpcallTarget,
    pub args: [usize; 3],
}

impl PendingUpcall {
    /// Converts to the process's register width. `None` if any field doesn't
    /// fit.
    pub fn frame<W: ProcessWord>(&self) -> Option<UpcallFrame<W>> {
        let [a0, a1, a2] = self.args;
        Some(UpcallFrame {
            fn_ptr: W::from_u64(self.target.fn_ptr)?,
            appdata: W::from_u64(self.target.appdata)?,
            args: [
                W::from_usize(a0)?,
                W::from_usize(a1)?,
                W::from_usize(a2)?,
            ],
        })
    }
}

/// Queues an upcall for the target registered in `region`'s slot
/// `subscribe`, if there is one.
pub(crate) fn schedule(
    kernel: &Kernel<'_>,
    process: &Process<'_>,
    driver: DriverNum,
    region: &GrantRegion<'_>,
    subscribe: usize,
    args: [usize; 3],
) -> Result<(), UpcallError> {
    let target = region
        .upcall(subscribe)
        .ok_or(UpcallError::InvalidSubscribeNum)?;
    let id = UpcallId {
        driver,
        subscribe: SubscribeNum(subscribe as u32),
    };
    if target.is_null() {
        ringbuf_entry!(
            kernel.trace_mut(),
            Trace::UpcallUnregistered(process.id(), id)
        );
        return Ok(());
    }

    match process.enqueue_upcall(PendingUpcall { id, target, args }) {
        Ok(()) => {
            ringbuf_entry!(
                kernel.trace_mut(),
                Trace::UpcallQueued(process.id(), id)
            );
            Ok(())
        }
        Err(e) => {
            ringbuf_entry!(
                kernel.trace_mut(),
                Trace::UpcallDropped(process.id(), id)
            );
            Err(e)
        }
    }
}

impl Kernel<'_> {
    /// Registers `target` in `process`'s slot `subscribe` of `driver`,
    /// returning whatever was registered there before (`None` if nothing
    /// was). Registering [`UpcallTarget::NULL`] withdraws interest.
    ///
    /// Upcalls already queued for this slot are discarded.
    ///
    /// This doesn't create the driver's grant; the dispatcher asks the driver
    /// to do that first.
    pub fn subscribe(
        &self,
        driver: DriverNum,
        process: ProcessId,
        subscribe: SubscribeNum,
        target: UpcallTarget,
    ) -> Result<Option<UpcallTarget>, UpcallError> {
        let slot = subscribe.0 as usize;
        let previous =
            grant::enter_kernel_managed(self, driver, process, |kdata| {
                kdata.swap_upcall(slot, target)
            })??;

        if let Some(p) = self.process(process) {
            p.purge_upcalls(UpcallId { driver, subscribe });
        }
        Ok(Some(previous).filter(|t| !t.is_null()))
    }

    /// Fires `process`'s slot `subscribe` of `driver` with `args`.
    ///
    /// If nothing is registered there, including when the process has gone
    /// away or never touched the driver, this quietly does nothing.
    pub fn fire(
        &self,
        driver: DriverNum,
        process: ProcessId,
        subscribe: SubscribeNum,
        args: [usize; 3],
    ) -> Result<(), UpcallError> {
        let Some(p) = self.process(process) else {
            ringbuf_entry!(self.trace_mut(), Trace::StaleProcess(process));
            return Ok(());
        };
        let Some(region) = p.find_grant(driver).and_then(|slot| {
            p.grant_cells(slot).and_then(GrantRegion::from_cells)
        }) else {
            return Ok(());
        };
        schedule(self, p, driver, &region, subscribe.0 as usize, args)
    }
}
