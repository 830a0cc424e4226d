// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of processes.
//!
//! A process, as far as this crate is concerned, is a block of RAM, an
//! optional block of flash, and two break pointers into the RAM:
//!
//! ```text
//!  ram_start            app_brk         kernel_brk             ram_end
//!     |  process-owned     |    (free)       |    grant regions    |
//!     +--------------------+-----------------+---------------------+
//!                                             <-- grows downward
//! ```
//!
//! Everything below `app_brk` belongs to the process. Everything at or above
//! `kernel_brk` belongs to capsules, in the form of grant regions, and is
//! invisible to the process. Grant regions are carved off the top in the order
//! capsules first touch them; nothing is ever freed individually. The whole
//! grant area goes back at once when the process is terminated or restarted.

use core::cell::{Cell, RefCell};

use abi::{DriverNum, ProcessId};
use heapless::Deque;

use crate::config::{GRANTS_PER_PROCESS, UPCALL_QUEUE_LEN};
use crate::err::{GrantError, ProcessError, UpcallError};
use crate::upcall::{PendingUpcall, UpcallId};

/// Memory handed to the kernel for one process by whoever loaded it.
///
/// Addresses here are the ones the process uses. On hardware they're the
/// real addresses of `ram` and `flash`; in host simulation they're whatever
/// the test likes.
#[derive(Copy, Clone)]
pub struct ProcessMemory<'a> {
    /// The process's entire RAM allocation, including the part that will
    /// become grant memory.
    pub ram: &'a [Cell<u8>],
    /// Process address of `ram[0]`.
    pub ram_start: usize,
    /// Initial application break: the first RAM address the process does
    /// *not* own.
    pub app_brk: usize,
    /// Read-only memory the process may share with capsules. May be empty.
    pub flash: &'a [u8],
    /// Process address of `flash[0]`.
    pub flash_start: usize,
}

impl<'a> ProcessMemory<'a> {
    /// Process memory with no flash.
    pub fn ram_only(
        ram: &'a [Cell<u8>],
        ram_start: usize,
        app_brk: usize,
    ) -> Self {
        Self {
            ram,
            ram_start,
            app_brk,
            flash: &[],
            flash_start: 0,
        }
    }

    pub fn with_flash(self, flash: &'a [u8], flash_start: usize) -> Self {
        Self {
            flash,
            flash_start,
            ..self
        }
    }

    /// Checks the layout rules:
    ///
    /// - neither block wraps the address space,
    /// - the application break lies within RAM,
    /// - flash, if present, is separated from RAM by at least one byte.
    ///
    /// The last rule keeps any valid buffer inside a single block.
    pub(crate) fn check(&self) -> Result<(), ProcessError> {
        let ram_end = self
            .ram_start
            .checked_add(self.ram.len())
            .ok_or(ProcessError::BadLayout)?;
        if self.app_brk < self.ram_start || self.app_brk > ram_end {
            return Err(ProcessError::BadLayout);
        }
        if !self.flash.is_empty() {
            let flash_end = self
                .flash_start
                .checked_add(self.flash.len())
                .ok_or(ProcessError::BadLayout)?;
            if !(flash_end < self.ram_start || ram_end < self.flash_start) {
                return Err(ProcessError::BadLayout);
            }
        }
        Ok(())
    }

    fn ram_end(&self) -> usize {
        // Checked at process creation.
        self.ram_start.wrapping_add(self.ram.len())
    }

    fn flash_end(&self) -> usize {
        self.flash_start.wrapping_add(self.flash.len())
    }
}

bitflags::bitflags! {
    /// What a process may do with a region of its memory.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct RegionAttributes: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// One entry in a process's memory map, as seen by the access checks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProcessRegion {
    pub base: usize,
    pub end: usize,
    pub attributes: RegionAttributes,
}

impl kerncore::MemoryRegion for ProcessRegion {
    fn contains(&self, addr: usize) -> bool {
        self.base <= addr && addr < self.end
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.end
    }
}

/// Record of one grant region in a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct GrantEntry {
    pub driver: DriverNum,
    /// Process address of the region's first byte.
    pub addr: usize,
    pub size: usize,
    /// Set while some stack frame holds the region open.
    pub entered: bool,
}

/// Internal representation of a process.
pub struct Process<'a> {
    id: ProcessId,
    memory: ProcessMemory<'a>,
    app_brk: Cell<usize>,
    kernel_brk: Cell<usize>,
    /// Grant table, filled in first-use order.
    grants: [Cell<Option<GrantEntry>>; GRANTS_PER_PROCESS],
    upcalls: RefCell<Deque<PendingUpcall, UPCALL_QUEUE_LEN>>,
    dropped_upcalls: Cell<u32>,
}

impl<'a> Process<'a> {
    /// Creates a process with no grants and nothing pending. `memory` must
    /// already have passed `ProcessMemory::check`.
    pub(crate) fn new(id: ProcessId, memory: ProcessMemory<'a>) -> Self {
        Self {
            id,
            memory,
            app_brk: Cell::new(memory.app_brk),
            kernel_brk: Cell::new(memory.ram_end()),
            grants: core::array::from_fn(|_| Cell::new(None)),
            upcalls: RefCell::new(Deque::new()),
            dropped_upcalls: Cell::new(0),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// The memory this process was created with, as originally described.
    pub fn memory(&self) -> ProcessMemory<'a> {
        self.memory
    }

    pub fn app_break(&self) -> usize {
        self.app_brk.get()
    }

    pub fn kernel_break(&self) -> usize {
        self.kernel_brk.get()
    }

    /// Moves the application break. The process can neither give up memory
    /// below the start of RAM nor claim memory that holds grants.
    pub(crate) fn set_app_break(
        &self,
        brk: usize,
    ) -> Result<(), ProcessError> {
        if brk < self.memory.ram_start || brk > self.kernel_brk.get() {
            return Err(ProcessError::BadBreak);
        }
        self.app_brk.set(brk);
        Ok(())
    }

    /// Bytes currently given over to grant regions.
    pub fn grant_memory_used(&self) -> usize {
        self.memory.ram_end() - self.kernel_brk.get()
    }

    /// Number of upcalls dropped because the queue was full or their
    /// arguments didn't fit the process's registers.
    pub fn dropped_upcalls(&self) -> u32 {
        self.dropped_upcalls.get()
    }

    pub fn pending_upcalls(&self) -> usize {
        self.upcalls.borrow().len()
    }

    /// Returns the memory map used to check process-supplied ranges, sorted
    /// by base address.
    ///
    /// Only memory the process owns appears here. The grant area, and the
    /// free space between the two breaks, are deliberately absent.
    pub(crate) fn regions(&self) -> [ProcessRegion; 2] {
        let ram = ProcessRegion {
            base: self.memory.ram_start,
            end: self.app_brk.get(),
            attributes: RegionAttributes::READ | RegionAttributes::WRITE,
        };
        let flash = if self.memory.flash.is_empty() {
            // Park an empty flash region at the bottom of the address space,
            // where it can't disturb the sort order.
            ProcessRegion {
                base: 0,
                end: 0,
                attributes: RegionAttributes::READ,
            }
        } else {
            ProcessRegion {
                base: self.memory.flash_start,
                end: self.memory.flash_end(),
                attributes: RegionAttributes::READ,
            }
        };
        if flash.base <= ram.base {
            [flash, ram]
        } else {
            [ram, flash]
        }
    }

    /// Looks up `[base, base + len)` in RAM. Performs no access checks.
    pub(crate) fn ram_cells(
        &self,
        base: usize,
        len: usize,
    ) -> Option<&'a [Cell<u8>]> {
        let offset = base.checked_sub(self.memory.ram_start)?;
        let end = offset.checked_add(len)?;
        self.memory.ram.get(offset..end)
    }

    /// Looks up `[base, base + len)` in flash. Performs no access checks.
    pub(crate) fn flash_bytes(
        &self,
        base: usize,
        len: usize,
    ) -> Option<&'a [u8]> {
        let offset = base.checked_sub(self.memory.flash_start)?;
        let end = offset.checked_add(len)?;
        self.memory.flash.get(offset..end)
    }

    /// Finds the grant table slot holding `driver`'s region, if it has one.
    pub(crate) fn find_grant(&self, driver: DriverNum) -> Option<usize> {
        self.grants.iter().position(|g| {
            g.get().is_some_and(|entry| entry.driver == driver)
        })
    }

    pub fn has_grant(&self, driver: DriverNum) -> bool {
        self.find_grant(driver).is_some()
    }

    /// Number of grant regions allocated so far.
    pub fn grant_count(&self) -> usize {
        self.grants.iter().filter(|g| g.get().is_some()).count()
    }

    pub(crate) fn grant_entry(&self, slot: usize) -> Option<GrantEntry> {
        self.grants.get(slot)?.get()
    }

    /// Carves `size` bytes, aligned to `align` (a power of two), off the top
    /// of the grant area, zero-fills them, and records them as `driver`'s.
    ///
    /// Returns the grant table slot. The caller is responsible for not asking
    /// twice for the same driver.
    pub(crate) fn allocate_grant(
        &self,
        driver: DriverNum,
        size: usize,
        align: usize,
    ) -> Result<usize, GrantError> {
        let slot = self
            .grants
            .iter()
            .position(|g| g.get().is_none())
            .ok_or(GrantError::OutOfGrantMemory)?;

        let addr = self
            .kernel_brk
            .get()
            .checked_sub(size)
            .ok_or(GrantError::OutOfGrantMemory)?
            & !(align - 1);
        if addr < self.app_brk.get() {
            return Err(GrantError::OutOfGrantMemory);
        }

        let cells = self
            .ram_cells(addr, size)
            .ok_or(GrantError::OutOfGrantMemory)?;
        for c in cells {
            c.set(0);
        }

        self.kernel_brk.set(addr);
        self.grants[slot].set(Some(GrantEntry {
            driver,
            addr,
            size,
            entered: false,
        }));
        Ok(slot)
    }

    /// Returns the bytes backing the grant in `slot`.
    pub(crate) fn grant_cells(&self, slot: usize) -> Option<&'a [Cell<u8>]> {
        let entry = self.grant_entry(slot)?;
        self.ram_cells(entry.addr, entry.size)
    }

    /// Marks the grant in `slot` as entered until the returned guard drops.
    pub(crate) fn enter_grant(
        &self,
        slot: usize,
    ) -> Result<EnteredGuard<'_>, GrantError> {
        let cell = self.grants.get(slot).ok_or(GrantError::NoSuchGrant)?;
        let mut entry = cell.get().ok_or(GrantError::NoSuchGrant)?;
        if entry.entered {
            return Err(GrantError::AlreadyEntered);
        }
        entry.entered = true;
        cell.set(Some(entry));
        Ok(EnteredGuard { cell })
    }

    pub(crate) fn enqueue_upcall(
        &self,
        upcall: PendingUpcall,
    ) -> Result<(), UpcallError> {
        if self.upcalls.borrow_mut().push_back(upcall).is_err() {
            self.count_dropped_upcall();
            return Err(UpcallError::QueueFull);
        }
        Ok(())
    }

    pub(crate) fn dequeue_upcall(&self) -> Option<PendingUpcall> {
        self.upcalls.borrow_mut().pop_front()
    }

    /// Removes every queued upcall for `id`, keeping the others in order.
    pub(crate) fn purge_upcalls(&self, id: UpcallId) {
        let mut queue = self.upcalls.borrow_mut();
        let mut old = core::mem::replace(&mut *queue, Deque::new());
        while let Some(upcall) = old.pop_front() {
            if upcall.id != id {
                // Can't fail: we're putting back no more than we took out.
                let _ = queue.push_back(upcall);
            }
        }
    }

    pub(crate) fn count_dropped_upcall(&self) {
        self.dropped_upcalls
            .set(self.dropped_upcalls.get().saturating_add(1));
    }
}

/// Holds a grant open. Dropping it, including during unwinding, closes the
/// grant again.
pub(crate) struct EnteredGuard<'p> {
    cell: &'p Cell<Option<GrantEntry>>,
}

impl Drop for EnteredGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.cell.get() {
            entry.entered = false;
            self.cell.set(Some(entry));
        }
    }
}
