// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with untrusted/unprivileged/user memory.
//!
//! A [`CapabilityPointerDescriptor`] is only ever an _allegation_ from a
//! process that some range of address space is suitable for something. It
//! could point into grant memory, at another process, off the end of the
//! address space. [`validate`] is the one place that allegation is checked,
//! and the buffer types here can only be produced by way of it.
//!
//! Process memory is reached exclusively through `Cell<u8>` (or, for flash,
//! `u8`) slices. This keeps the kernel sound when a process shares
//! overlapping ranges with the same capsule twice, once read-only and once
//! read-write, which it is entirely free to do.

use core::cell::Cell;

use abi::{
    CapPerms, CapabilityMeta, CapabilityPointerDescriptor, ErrorCode,
    ProcessWord,
};
use kerncore::{check_coverage, Coverage, UserSlice};

use crate::config::MAX_ALLOW_LEN;
use crate::err::ValidationError;
use crate::process::{Process, RegionAttributes};

/// Kind of access a descriptor is being validated for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    ReadWrite,
}

impl Access {
    fn region_attributes(self) -> RegionAttributes {
        match self {
            Self::Read => RegionAttributes::READ,
            Self::ReadWrite => RegionAttributes::READ | RegionAttributes::WRITE,
        }
    }

    fn cap_perms(self) -> CapPerms {
        match self {
            Self::Read => CapPerms::LOAD,
            Self::ReadWrite => CapPerms::LOAD | CapPerms::STORE,
        }
    }
}

/// A descriptor that has passed validation, now at kernel width.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ValidatedRegion {
    pub base: usize,
    pub len: usize,
    pub capability: Option<CapabilityMeta>,
}

impl ValidatedRegion {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl UserSlice for ValidatedRegion {
    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        // Overflow was ruled out before one of these was built.
        self.base.wrapping_add(self.len)
    }
}

/// Checks that `process` may access `descriptor`'s range for `access`.
///
/// In order:
///
/// 1. A zero-length descriptor is valid whatever its base, and confers
///    nothing.
/// 2. The range must not wrap at the process's width, must be representable
///    at the kernel's, and must not exceed the configured maximum share
///    length.
/// 3. The range must lie entirely within memory the process owns (RAM below
///    its break, plus flash). Grant memory is never included.
/// 4. If the descriptor carries a capability, its tag must be set and its
///    bounds must cover the range.
/// 5. The memory must permit `access`; no writing to flash.
/// 6. The capability, if any, must permit `access`.
///
/// Steps 2 through 4 fail with `OutOfBounds`, steps 5 and 6 with
/// `PermissionDenied`.
pub fn validate<W: ProcessWord>(
    descriptor: &CapabilityPointerDescriptor<W>,
    process: &Process<'_>,
    access: Access,
) -> Result<ValidatedRegion, ValidationError> {
    if descriptor.is_empty() {
        return Ok(ValidatedRegion {
            base: descriptor.base.to_usize().unwrap_or(0),
            len: 0,
            capability: None,
        });
    }

    descriptor
        .checked_end()
        .ok_or(ValidationError::OutOfBounds)?;
    let base = descriptor
        .base
        .to_usize()
        .ok_or(ValidationError::OutOfBounds)?;
    let len = descriptor
        .len
        .to_usize()
        .ok_or(ValidationError::OutOfBounds)?;
    base.checked_add(len).ok_or(ValidationError::OutOfBounds)?;
    if MAX_ALLOW_LEN.is_some_and(|max| len > max) {
        return Err(ValidationError::OutOfBounds);
    }

    let region = ValidatedRegion {
        base,
        len,
        capability: descriptor.capability,
    };

    let wanted = access.region_attributes();
    let coverage = check_coverage(region, &process.regions(), |r| {
        r.attributes.contains(wanted)
    });
    if coverage == Coverage::Uncovered {
        return Err(ValidationError::OutOfBounds);
    }

    if let Some(cap) = &descriptor.capability {
        if !cap.tag || !cap.covers(base as u64, len as u64) {
            return Err(ValidationError::OutOfBounds);
        }
    }

    if coverage == Coverage::Forbidden {
        return Err(ValidationError::PermissionDenied);
    }

    if let Some(cap) = &descriptor.capability {
        if !cap.permits(access.cap_perms()) {
            return Err(ValidationError::PermissionDenied);
        }
    }

    Ok(region)
}

/// Validates `descriptor` for reading and returns a view of the memory.
pub fn readonly_buffer<'a, W: ProcessWord>(
    descriptor: &CapabilityPointerDescriptor<W>,
    process: &Process<'a>,
) -> Result<ReadOnlyProcessBuffer<'a>, ValidationError> {
    let region = validate(descriptor, process, Access::Read)?;
    if region.is_empty() {
        return Ok(ReadOnlyProcessBuffer::empty());
    }
    // Flash and RAM never touch, so a valid range is wholly in one of them.
    let mem = if let Some(cells) = process.ram_cells(region.base, region.len)
    {
        ReadOnlyMemory::Ram(cells)
    } else if let Some(bytes) = process.flash_bytes(region.base, region.len) {
        ReadOnlyMemory::Flash(bytes)
    } else {
        return Err(ValidationError::OutOfBounds);
    };
    Ok(ReadOnlyProcessBuffer {
        base: region.base,
        mem,
    })
}

/// Validates `descriptor` for writing and returns a view of the memory.
pub fn readwrite_buffer<'a, W: ProcessWord>(
    descriptor: &CapabilityPointerDescriptor<W>,
    process: &Process<'a>,
) -> Result<ReadWriteProcessBuffer<'a>, ValidationError> {
    let region = validate(descriptor, process, Access::ReadWrite)?;
    if region.is_empty() {
        return Ok(ReadWriteProcessBuffer::empty());
    }
    let cells = process
        .ram_cells(region.base, region.len)
        .ok_or(ValidationError::OutOfBounds)?;
    Ok(ReadWriteProcessBuffer {
        base: region.base,
        cells,
    })
}

#[derive(Copy, Clone, Debug)]
enum ReadOnlyMemory<'a> {
    Ram(&'a [Cell<u8>]),
    Flash(&'a [u8]),
}

/// Process memory a capsule may read: part of the process's RAM or flash.
#[derive(Copy, Clone, Debug)]
pub struct ReadOnlyProcessBuffer<'a> {
    base: usize,
    mem: ReadOnlyMemory<'a>,
}

impl<'a> ReadOnlyProcessBuffer<'a> {
    /// A buffer of length zero, as for an allow slot the process never
    /// filled.
    pub fn empty() -> Self {
        Self {
            base: 0,
            mem: ReadOnlyMemory::Flash(&[]),
        }
    }

    /// Process address of the first byte.
    pub fn ptr(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        match self.mem {
            ReadOnlyMemory::Ram(c) => c.len(),
            ReadOnlyMemory::Flash(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<u8> {
        match self.mem {
            ReadOnlyMemory::Ram(c) => c.get(i).map(Cell::get),
            ReadOnlyMemory::Flash(b) => b.get(i).copied(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + 'a {
        let mem = self.mem;
        let n = self.len();
        (0..n).map(move |i| match mem {
            ReadOnlyMemory::Ram(c) => c[i].get(),
            ReadOnlyMemory::Flash(b) => b[i],
        })
    }

    /// Copies the start of the buffer into `dest`, which must be no longer
    /// than the buffer.
    pub fn copy_to_slice(&self, dest: &mut [u8]) -> Result<(), ErrorCode> {
        if dest.len() > self.len() {
            return Err(ErrorCode::Size);
        }
        for (d, s) in dest.iter_mut().zip(self.iter()) {
            *d = s;
        }
        Ok(())
    }
}

/// Process RAM a capsule may read and write.
#[derive(Copy, Clone, Debug)]
pub struct ReadWriteProcessBuffer<'a> {
    base: usize,
    cells: &'a [Cell<u8>],
}

impl<'a> ReadWriteProcessBuffer<'a> {
    pub fn empty() -> Self {
        Self {
            base: 0,
            cells: &[],
        }
    }

    /// Process address of the first byte.
    pub fn ptr(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn as_cells(&self) -> &'a [Cell<u8>] {
        self.cells
    }

    pub fn get(&self, i: usize) -> Option<u8> {
        self.cells.get(i).map(Cell::get)
    }

    pub fn set(&self, i: usize, value: u8) -> Result<(), ErrorCode> {
        self.cells.get(i).ok_or(ErrorCode::Size)?.set(value);
        Ok(())
    }

    /// Copies the start of the buffer into `dest`, which must be no longer
    /// than the buffer.
    pub fn copy_to_slice(&self, dest: &mut [u8]) -> Result<(), ErrorCode> {
        if dest.len() > self.len() {
            return Err(ErrorCode::Size);
        }
        for (d, s) in dest.iter_mut().zip(self.cells) {
            *d = s.get();
        }
        Ok(())
    }

    /// Copies `src` into the start of the buffer, which must be at least as
    /// long.
    pub fn copy_from_slice(&self, src: &[u8]) -> Result<(), ErrorCode> {
        if src.len() > self.len() {
            return Err(ErrorCode::Size);
        }
        for (d, s) in self.cells.iter().zip(src) {
            d.set(*s);
        }
        Ok(())
    }

    /// Views the same memory read-only.
    pub fn as_readonly(&self) -> ReadOnlyProcessBuffer<'a> {
        ReadOnlyProcessBuffer {
            base: self.base,
            mem: ReadOnlyMemory::Ram(self.cells),
        }
    }
}
