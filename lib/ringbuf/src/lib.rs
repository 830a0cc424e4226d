// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deduplicating event trace buffer for the kernel.
//!
//! A [`Ringbuf`] holds the last `N` events recorded by some part of the
//! kernel. Each event is stored alongside the source line that recorded it,
//! a per-slot generation number, and a repeat count: recording the same
//! `(line, payload)` twice in a row bumps the count of the newest entry
//! instead of consuming a new slot, so a tight loop of identical events can't
//! flush the interesting history out of the buffer.
//!
//! Unlike a task-level trace buffer, the kernel's buffers are owned by the
//! structure they describe (the kernel keeps one per instance) rather than
//! living in a named `static`. That keeps two kernel instances -- as happens
//! in host tests -- from scribbling over each other.
//!
//! ## Recording
//!
//! ```
//! use ringbuf::{ringbuf_entry, Ringbuf};
//!
//! #[derive(Copy, Clone, PartialEq, Debug)]
//! enum Trace {
//!     None,
//!     Tick(u32),
//! }
//!
//! let mut buf: Ringbuf<Trace, 8> = Ringbuf::new(Trace::None);
//! ringbuf_entry!(buf, Trace::Tick(1));
//! ringbuf_entry!(buf, Trace::Tick(1));
//! # if cfg!(not(feature = "disabled")) {
//! assert_eq!(buf.last().map(|e| e.count), Some(2));
//! # }
//! ```
//!
//! The payload type must be `Copy + PartialEq`. Enable the `disabled` feature
//! to compile recording out while keeping call sites intact.

#![cfg_attr(not(test), no_std)]

/// Records `payload` into `buf`, tagging it with the caller's source line.
///
/// `buf` may be anything that derefs mutably to a [`Ringbuf`], such as a
/// `RefMut` borrowed out of a `RefCell`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before borrowing the buffer, so a payload
        // expression that itself inspects the buffer doesn't trip a RefCell.
        let p = $payload;
        // Method syntax so that autoderef sees through `RefMut` and friends.
        $buf.entry(line!() as u16, p);
    }};
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
}

/// A single recorded event.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    /// Source line of the `ringbuf_entry!` that produced this entry.
    pub line: u16,
    /// Number of times this slot has been (re)written. Zero means the slot
    /// has never held an event.
    pub generation: u16,
    /// Number of consecutive identical events folded into this entry.
    pub count: u32,
    pub payload: T,
}

/// A fixed-capacity trace of the most recent `N` events.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    /// Creates an empty buffer with every slot holding `init`.
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    /// Records an event. Prefer the [`ringbuf_entry!`] macro, which fills in
    /// `line` for you.
    pub fn entry(&mut self, line: u16, payload: T) {
        if N == 0 {
            return;
        }

        if let Some(ent) = self.last.and_then(|i| self.buffer.get_mut(i)) {
            if ent.line == line && ent.payload == payload {
                if let Some(count) = ent.count.checked_add(1) {
                    ent.count = count;
                    return;
                }
                // Saturated; fall through and start a fresh entry.
            }
        }

        let next = match self.last {
            Some(i) if i + 1 < N => i + 1,
            _ => 0,
        };
        let slot = &mut self.buffer[next];
        *slot = RingbufEntry {
            line,
            generation: slot.generation.wrapping_add(1).max(1),
            count: 1,
            payload,
        };
        self.last = Some(next);
    }

    /// Returns the most recently written entry, if any.
    pub fn last(&self) -> Option<&RingbufEntry<T>> {
        self.last.map(|i| &self.buffer[i])
    }

    /// Iterates over the recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(i) => i + 1,
            None => N,
        };
        (0..N)
            .map(move |k| &self.buffer[(start + k) % N.max(1)])
            .filter(|e| e.generation != 0)
            .take(if self.last.is_some() { N } else { 0 })
    }

    /// Forgets all recorded entries.
    pub fn clear(&mut self) {
        for ent in &mut self.buffer {
            ent.generation = 0;
            ent.count = 0;
        }
        self.last = None;
    }
}
