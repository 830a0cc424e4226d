// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Grants: capsule-private storage inside process memory.
//!
//! A capsule that needs per-process state declares a [`Grant`] over some
//! plain-old-data type `T`. The first time the capsule enters the grant for
//! a given process, the kernel carves a region for it off the top of that
//! process's grant area and zero-fills it. From then on, entering gives the
//! capsule `&mut T` for the duration of a closure.
//!
//! Each region has a kernel-managed prefix in front of `T`:
//!
//! ```text
//! +--------+----------------+--------------------+--------------------+-----+
//! | header | upcall slots   | read-only allows   | read-write allows  |  T  |
//! | 8 B    | 16 B x UPCALLS | 40 B x ALLOW_RO    | 40 B x ALLOW_RW    |     |
//! +--------+----------------+--------------------+--------------------+-----+
//! ```
//!
//! The slot counts are const parameters of the `Grant`, so a capsule
//! declares exactly how many notification and buffer slots it wants, and the
//! dispatcher can reject out-of-range numbers without the capsule's help.
//!
//! Process memory is only reachable through `Cell<u8>`, so `T` is copied out
//! on entry and back on exit. The entered flag keeps that copy from being
//! raced by a nested entry of the same grant.

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::size_of;

use abi::{
    CapPerms, CapabilityMeta, CapabilityPointerDescriptor, DriverNum,
    ErrorCode, ProcessId,
};
use ringbuf::ringbuf_entry;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::err::{DispatchError, GrantError, UpcallError};
use crate::kernel::{Kernel, Trace};
use crate::process::Process;
use crate::umem::{
    readonly_buffer, readwrite_buffer, ReadOnlyProcessBuffer,
    ReadWriteProcessBuffer,
};
use crate::upcall::{self, UpcallTarget};

/// Alignment of every grant region, and of `T` within it.
pub const GRANT_ALIGN: usize = 8;

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct GrantHeader {
    driver_num: u32,
    upcalls: u8,
    allow_ro: u8,
    allow_rw: u8,
    _reserved: u8,
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct SavedUpcall {
    fn_ptr: u64,
    appdata: u64,
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct SavedAllow {
    base: u64,
    len: u64,
    cap_base: u64,
    cap_length: u64,
    cap_perms: u32,
    flags: u32,
}

const_assert_eq!(size_of::<GrantHeader>(), 8);
const_assert_eq!(size_of::<SavedUpcall>(), 16);
const_assert_eq!(size_of::<SavedAllow>(), 40);

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct AllowFlags: u32 {
        /// The allow carried capability metadata.
        const CAPABILITY = 1 << 0;
        /// ...and its tag was set.
        const TAG = 1 << 1;
    }
}

impl SavedAllow {
    fn from_descriptor(d: &CapabilityPointerDescriptor<u64>) -> Self {
        let (cap_base, cap_length, cap_perms, flags) = match d.capability {
            Some(c) => {
                let mut flags = AllowFlags::CAPABILITY;
                flags.set(AllowFlags::TAG, c.tag);
                (c.base, c.length, c.perms.bits(), flags)
            }
            None => (0, 0, 0, AllowFlags::empty()),
        };
        Self {
            base: d.base,
            len: d.len,
            cap_base,
            cap_length,
            cap_perms,
            flags: flags.bits(),
        }
    }

    fn to_descriptor(self) -> CapabilityPointerDescriptor<u64> {
        let flags = AllowFlags::from_bits_truncate(self.flags);
        CapabilityPointerDescriptor {
            base: self.base,
            len: self.len,
            capability: flags.contains(AllowFlags::CAPABILITY).then(|| {
                CapabilityMeta {
                    tag: flags.contains(AllowFlags::TAG),
                    base: self.cap_base,
                    length: self.cap_length,
                    perms: CapPerms::from_bits_truncate(self.cap_perms),
                }
            }),
        }
    }
}

/// Copies a `T` out of process memory. Short input leaves the tail zeroed.
fn load<T: FromBytes + IntoBytes>(cells: &[Cell<u8>]) -> T {
    let mut value = T::new_zeroed();
    for (b, c) in value.as_mut_bytes().iter_mut().zip(cells) {
        *b = c.get();
    }
    value
}

/// Copies a `T` into process memory.
fn store<T: IntoBytes + Immutable>(cells: &[Cell<u8>], value: &T) {
    for (c, b) in cells.iter().zip(value.as_bytes()) {
        c.set(*b);
    }
}

/// Sizes and offsets of one grant region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct GrantLayout {
    upcalls: usize,
    allow_ro: usize,
    allow_rw: usize,
    data_size: usize,
}

impl GrantLayout {
    const fn upcalls_offset(&self) -> usize {
        size_of::<GrantHeader>()
    }

    const fn allow_ro_offset(&self) -> usize {
        self.upcalls_offset() + self.upcalls * size_of::<SavedUpcall>()
    }

    const fn allow_rw_offset(&self) -> usize {
        self.allow_ro_offset() + self.allow_ro * size_of::<SavedAllow>()
    }

    const fn data_offset(&self) -> usize {
        let end =
            self.allow_rw_offset() + self.allow_rw * size_of::<SavedAllow>();
        end.next_multiple_of(GRANT_ALIGN)
    }

    const fn total(&self) -> usize {
        self.data_offset() + self.data_size
    }
}

/// Read-only-or-read-write selector for allow slots.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum AllowKind {
    ReadOnly,
    ReadWrite,
}

/// An allocated grant region, viewed through its kernel-managed prefix.
pub(crate) struct GrantRegion<'a> {
    cells: &'a [Cell<u8>],
    layout: GrantLayout,
}

impl<'a> GrantRegion<'a> {
    /// Interprets `cells` as a grant region, reading its shape from the
    /// header. `None` if the header describes something that doesn't fit.
    pub(crate) fn from_cells(cells: &'a [Cell<u8>]) -> Option<Self> {
        let header: GrantHeader =
            load(cells.get(..size_of::<GrantHeader>())?);
        let mut layout = GrantLayout {
            upcalls: usize::from(header.upcalls),
            allow_ro: usize::from(header.allow_ro),
            allow_rw: usize::from(header.allow_rw),
            data_size: 0,
        };
        layout.data_size = cells.len().checked_sub(layout.data_offset())?;
        Some(Self { cells, layout })
    }

    /// Writes the header for `layout` into freshly zeroed memory.
    fn initialize(
        cells: &'a [Cell<u8>],
        driver: DriverNum,
        layout: GrantLayout,
    ) -> Option<Self> {
        let header = GrantHeader {
            driver_num: driver.0,
            upcalls: u8::try_from(layout.upcalls).ok()?,
            allow_ro: u8::try_from(layout.allow_ro).ok()?,
            allow_rw: u8::try_from(layout.allow_rw).ok()?,
            _reserved: 0,
        };
        store(cells, &header);
        Self::from_cells(cells)
    }

    fn slot(&self, offset: usize, size: usize, n: usize) -> &'a [Cell<u8>] {
        let start = offset + n * size;
        &self.cells[start..start + size]
    }

    pub(crate) fn upcall(&self, n: usize) -> Option<UpcallTarget> {
        if n >= self.layout.upcalls {
            return None;
        }
        let s: SavedUpcall = load(self.slot(
            self.layout.upcalls_offset(),
            size_of::<SavedUpcall>(),
            n,
        ));
        Some(UpcallTarget::new(s.fn_ptr, s.appdata))
    }

    fn set_upcall(&self, n: usize, target: UpcallTarget) {
        let offset = self.layout.upcalls_offset();
        store(
            self.slot(offset, size_of::<SavedUpcall>(), n),
            &SavedUpcall {
                fn_ptr: target.fn_ptr,
                appdata: target.appdata,
            },
        );
    }

    fn allow_slot(
        &self,
        kind: AllowKind,
        n: usize,
    ) -> Option<&'a [Cell<u8>]> {
        let (offset, count) = match kind {
            AllowKind::ReadOnly => {
                (self.layout.allow_ro_offset(), self.layout.allow_ro)
            }
            AllowKind::ReadWrite => {
                (self.layout.allow_rw_offset(), self.layout.allow_rw)
            }
        };
        (n < count).then(|| self.slot(offset, size_of::<SavedAllow>(), n))
    }

    fn allow(
        &self,
        kind: AllowKind,
        n: usize,
    ) -> Option<CapabilityPointerDescriptor<u64>> {
        let saved: SavedAllow = load(self.allow_slot(kind, n)?);
        Some(saved.to_descriptor())
    }

    fn data(&self) -> &'a [Cell<u8>] {
        &self.cells[self.layout.data_offset()..]
    }
}

/// The kernel-managed part of an entered grant, handed to capsules alongside
/// their own data.
pub struct GrantKernelData<'g> {
    kernel: &'g Kernel<'g>,
    process: &'g Process<'g>,
    driver: DriverNum,
    region: GrantRegion<'g>,
}

impl<'g> GrantKernelData<'g> {
    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    pub fn num_upcalls(&self) -> usize {
        self.region.layout.upcalls
    }

    pub fn num_allow_ro(&self) -> usize {
        self.region.layout.allow_ro
    }

    pub fn num_allow_rw(&self) -> usize {
        self.region.layout.allow_rw
    }

    /// Queues the upcall registered in slot `subscribe_num`, if any. Firing
    /// an empty slot is not an error.
    pub fn schedule_upcall(
        &self,
        subscribe_num: usize,
        args: [usize; 3],
    ) -> Result<(), UpcallError> {
        upcall::schedule(
            self.kernel,
            self.process,
            self.driver,
            &self.region,
            subscribe_num,
            args,
        )
    }

    /// Returns the buffer the process shared in read-only slot `n`,
    /// revalidated against the process's memory as it stands now.
    pub fn get_readonly_processbuffer(
        &self,
        n: usize,
    ) -> Result<ReadOnlyProcessBuffer<'g>, ErrorCode> {
        let d = self
            .region
            .allow(AllowKind::ReadOnly, n)
            .ok_or(ErrorCode::NoSupport)?;
        Ok(readonly_buffer(&d, self.process)?)
    }

    /// Returns the buffer the process shared in read-write slot `n`,
    /// revalidated against the process's memory as it stands now.
    pub fn get_readwrite_processbuffer(
        &self,
        n: usize,
    ) -> Result<ReadWriteProcessBuffer<'g>, ErrorCode> {
        let d = self
            .region
            .allow(AllowKind::ReadWrite, n)
            .ok_or(ErrorCode::NoSupport)?;
        Ok(readwrite_buffer(&d, self.process)?)
    }

    /// Installs `target` in upcall slot `n`, returning the old one.
    pub(crate) fn swap_upcall(
        &self,
        n: usize,
        target: UpcallTarget,
    ) -> Result<UpcallTarget, UpcallError> {
        let previous =
            self.region.upcall(n).ok_or(UpcallError::InvalidSubscribeNum)?;
        self.region.set_upcall(n, target);
        Ok(previous)
    }

    /// What upcall slot `n` holds now.
    pub(crate) fn upcall(
        &self,
        n: usize,
    ) -> Result<UpcallTarget, UpcallError> {
        self.region.upcall(n).ok_or(UpcallError::InvalidSubscribeNum)
    }

    /// What allow slot `n` holds now.
    pub(crate) fn allow(
        &self,
        kind: AllowKind,
        n: usize,
    ) -> Result<CapabilityPointerDescriptor<u64>, DispatchError> {
        self.region.allow(kind, n).ok_or(DispatchError::NoSuchAllow)
    }

    /// Installs `descriptor` in allow slot `n`. The caller must have
    /// validated it.
    pub(crate) fn set_allow(
        &self,
        kind: AllowKind,
        n: usize,
        descriptor: &CapabilityPointerDescriptor<u64>,
    ) -> Result<(), DispatchError> {
        let cells = self
            .region
            .allow_slot(kind, n)
            .ok_or(DispatchError::NoSuchAllow)?;
        store(cells, &SavedAllow::from_descriptor(descriptor));
        Ok(())
    }
}

/// Region of capsule-private storage in every process.
///
/// `T` is the capsule's per-process state. It must be plain old data: the
/// kernel zero-fills it on allocation, and copies it in and out of process
/// memory on every entry.
///
/// `UPCALLS`, `ALLOW_RO` and `ALLOW_RW` fix the number of subscribe and
/// allow slots the kernel keeps for this capsule in each process.
pub struct Grant<T, const UPCALLS: u8, const ALLOW_RO: u8, const ALLOW_RW: u8>
{
    driver: DriverNum,
    _data: PhantomData<fn() -> T>,
}

impl<T, const UPCALLS: u8, const ALLOW_RO: u8, const ALLOW_RW: u8>
    Grant<T, UPCALLS, ALLOW_RO, ALLOW_RW>
where
    T: FromBytes + IntoBytes + Immutable,
{
    const LAYOUT: GrantLayout = GrantLayout {
        upcalls: UPCALLS as usize,
        allow_ro: ALLOW_RO as usize,
        allow_rw: ALLOW_RW as usize,
        data_size: size_of::<T>(),
    };

    /// Declares a grant for the capsule registered as `driver`.
    ///
    /// There should be exactly one `Grant` per driver number.
    pub const fn new(driver: DriverNum) -> Self {
        Self {
            driver,
            _data: PhantomData,
        }
    }

    pub fn driver_num(&self) -> DriverNum {
        self.driver
    }

    /// Runs `f` with exclusive access to this capsule's state in `process`,
    /// allocating it first if this is the first time.
    ///
    /// Fails with
    ///
    /// - `NoSuchGrant` if `process` is stale,
    /// - `AlreadyEntered` if this grant is already entered for `process`
    ///   somewhere up the stack (other grants, and this grant for other
    ///   processes, are fine),
    /// - `OutOfGrantMemory` if the region can't be allocated.
    pub fn enter<F, R>(
        &self,
        kernel: &Kernel<'_>,
        process: ProcessId,
        f: F,
    ) -> Result<R, GrantError>
    where
        F: FnOnce(&mut T, &GrantKernelData<'_>) -> R,
    {
        let p = kernel.process(process).ok_or(GrantError::NoSuchGrant)?;
        let slot = match p.find_grant(self.driver) {
            Some(slot) => slot,
            None => allocate(kernel, p, self.driver, Self::LAYOUT)?,
        };
        enter_slot(kernel, p, self.driver, slot, Self::LAYOUT, f)
    }

    /// Runs `f` once for every live process in which this grant has been
    /// allocated, skipping any where it is currently entered. Never
    /// allocates.
    ///
    /// Returns the number of processes visited.
    pub fn each<F>(&self, kernel: &Kernel<'_>, mut f: F) -> usize
    where
        F: FnMut(ProcessId, &mut T, &GrantKernelData<'_>),
    {
        let mut visited = 0;
        for p in kernel.processes() {
            let Some(slot) = p.find_grant(self.driver) else {
                continue;
            };
            let id = p.id();
            let entered = enter_slot::<T, _, _>(
                kernel,
                p,
                self.driver,
                slot,
                Self::LAYOUT,
                |t, k| f(id, t, k),
            );
            // Entered further up the stack: skip it.
            if entered.is_ok() {
                visited += 1;
            }
        }
        visited
    }
}

fn allocate(
    kernel: &Kernel<'_>,
    process: &Process<'_>,
    driver: DriverNum,
    layout: GrantLayout,
) -> Result<usize, GrantError> {
    let r = process
        .allocate_grant(driver, layout.total(), GRANT_ALIGN)
        .and_then(|slot| {
            let cells =
                process.grant_cells(slot).ok_or(GrantError::NoSuchGrant)?;
            GrantRegion::initialize(cells, driver, layout)
                .ok_or(GrantError::LayoutMismatch)?;
            Ok(slot)
        });
    match r {
        Ok(_) => ringbuf_entry!(
            kernel.trace_mut(),
            Trace::GrantAllocated {
                process: process.id(),
                driver,
                size: layout.total(),
            }
        ),
        Err(error) => ringbuf_entry!(
            kernel.trace_mut(),
            Trace::GrantRefused {
                process: process.id(),
                driver,
                error,
            }
        ),
    }
    r
}

fn enter_slot<T, F, R>(
    kernel: &Kernel<'_>,
    process: &Process<'_>,
    driver: DriverNum,
    slot: usize,
    layout: GrantLayout,
    f: F,
) -> Result<R, GrantError>
where
    T: FromBytes + IntoBytes + Immutable,
    F: FnOnce(&mut T, &GrantKernelData<'_>) -> R,
{
    let _guard = process.enter_grant(slot)?;
    let region = process
        .grant_cells(slot)
        .and_then(GrantRegion::from_cells)
        .ok_or(GrantError::NoSuchGrant)?;
    if region.layout != layout {
        return Err(GrantError::LayoutMismatch);
    }

    let data = region.data();
    let mut value: T = load(data);
    let kdata = GrantKernelData {
        kernel,
        process,
        driver,
        region,
    };
    let r = f(&mut value, &kdata);
    store(data, &value);
    Ok(r)
}

/// Enters only the kernel-managed part of `driver`'s grant in `process`.
///
/// This is how the kernel services subscribe and allow without knowing the
/// capsule's `T`. It can't allocate, for the same reason.
pub(crate) fn enter_kernel_managed<R>(
    kernel: &Kernel<'_>,
    driver: DriverNum,
    process: ProcessId,
    f: impl FnOnce(&GrantKernelData<'_>) -> R,
) -> Result<R, GrantError> {
    let p = kernel.process(process).ok_or(GrantError::NoSuchGrant)?;
    let slot = p.find_grant(driver).ok_or(GrantError::NoSuchGrant)?;
    let _guard = p.enter_grant(slot)?;
    let region = p
        .grant_cells(slot)
        .and_then(GrantRegion::from_cells)
        .ok_or(GrantError::NoSuchGrant)?;
    Ok(f(&GrantKernelData {
        kernel,
        process: p,
        driver,
        region,
    }))
}
