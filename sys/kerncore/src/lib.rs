// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture- and kernel-independent memory coverage checks.
//!
//! This is split out from the kernel so it can be tested (and fuzzed) on the
//! host without dragging in any of the kernel's process machinery.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

use core::cmp::Ordering;

/// Describes types that act as "slices" (in the very abstract sense) claimed
/// by processes in syscalls.
///
/// This is not the same thing as a Rust slice in the kernel, because this is
/// just a base-length pair --- taken by itself, it doesn't let you actually
/// _access_ the memory.
///
/// # Invariants
///
/// `s.is_empty()` implies `s.base_addr() == s.end_addr()`, and vice versa.
///
/// `s.base_addr() <= s.end_addr()` must hold. Types whose end can't be
/// computed without wrapping must be rejected before they get here.
pub trait UserSlice {
    /// Checks whether the slice spans zero bytes. Empty slices are opted out of
    /// access checking: they confer no authority.
    fn is_empty(&self) -> bool;

    /// The address of the first byte included in this slice.
    fn base_addr(&self) -> usize;

    /// The address of the first byte _not_ included in this slice, past the
    /// end.
    fn end_addr(&self) -> usize;
}

impl<T: UserSlice> UserSlice for &T {
    #[inline(always)]
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Describes types that indicate region permissions.
///
/// This type is _almost_ identical to `UserSlice` but has slightly different
/// operations defined on it. Those operations _do not_ include region
/// attributes, which might be surprising, but we handle those generically using
/// a predicate when required.
///
/// # Invariants
///
/// `r.contains(x)` implies `r.base_addr() <= x < r.end_addr()` and vice versa.
///
/// By extension, `r.base_addr() <= r.end_addr()` must hold.
pub trait MemoryRegion {
    fn contains(&self, addr: usize) -> bool;
    fn base_addr(&self) -> usize;
    fn end_addr(&self) -> usize;
}

impl<T: MemoryRegion> MemoryRegion for &T {
    #[inline(always)]
    fn contains(&self, addr: usize) -> bool {
        (**self).contains(addr)
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Compares a memory region to an address for use in binary-searching a region
/// table.
///
/// This will return `Equal` if the address falls within the region, `Greater`
/// if the address is lower, `Less` if the address is higher. i.e. it returns
/// the status of the region relative to the address, not vice versa.
#[inline(always)]
fn region_compare(region: &impl MemoryRegion, addr: usize) -> Ordering {
    if addr < region.base_addr() {
        Ordering::Greater
    } else if addr >= region.end_addr() {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Outcome of checking a slice against a region table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Coverage {
    /// Every byte of the slice lies in a region that satisfied the predicate
    /// (or the slice was empty).
    Covered,
    /// Some byte of the slice lies outside every region in the table.
    Uncovered,
    /// Every byte lies in some region, but at least one of those regions
    /// failed the predicate.
    Forbidden,
}

/// Determines how well a region table covers a slice.
///
/// The memory is described by `slice` and consists of a single contiguous
/// range. The process's memory is described by `table`, an array of region
/// descriptors. Not all regions confer the same rights --- some are
/// read-only, some belong to the kernel --- so the caller supplies a
/// `region_ok` predicate to express what it needs.
///
/// A slice that runs off the edge of the mapped memory is reported as
/// [`Coverage::Uncovered`] even if it also touches a region that fails the
/// predicate; missing memory is the more fundamental problem.
///
/// # Preconditions
///
/// `table` must be sorted by region base address, and the regions in the table
/// must not overlap.
///
/// Both `slice` and each element of `table` must meet the properties described
/// on [`UserSlice`] and [`MemoryRegion`], respectively.
#[must_use]
pub fn check_coverage<S, R>(
    slice: S,
    table: &[R],
    region_ok: impl Fn(&R) -> bool,
) -> Coverage
where
    S: UserSlice,
    R: MemoryRegion,
{
    if slice.is_empty() {
        // Empty slices confer no authority as far as the kernel is
        // concerned, so their base address doesn't matter.
        return Coverage::Covered;
    }

    // The slice may span multiple regions, but the regions that are spanned
    // must be perfectly contiguous. The table is sorted and non-overlapping,
    // which lets us use a binary search followed by a short scan.
    let mut scan_addr = slice.base_addr();
    let end_addr = slice.end_addr();

    let Ok(index) =
        table.binary_search_by(|reg| region_compare(reg, scan_addr))
    else {
        // No region contained the start address.
        return Coverage::Uncovered;
    };

    let mut forbidden = false;
    for region in &table[index..] {
        if !region.contains(scan_addr) {
            // We've hit a hole without finishing our scan.
            return Coverage::Uncovered;
        }
        forbidden |= !region_ok(region);

        if end_addr <= region.end_addr() {
            return if forbidden {
                Coverage::Forbidden
            } else {
                Coverage::Covered
            };
        }

        scan_addr = region.end_addr();
    }

    // Ran off the end of the table.
    Coverage::Uncovered
}
