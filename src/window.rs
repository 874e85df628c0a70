//! Fixed-capacity byte window with fill and drain cursors.
//!
//! One abstraction backs all three session buffers:
//!
//! | Window | Holds                                   | Capacity                      |
//! |--------|-----------------------------------------|-------------------------------|
//! | recv   | ciphertext read from the socket         | `header + max_chunk + trailer` |
//! | ready  | decrypted plaintext awaiting the caller | `max_chunk`                    |
//! | send   | sealed records awaiting the socket      | `header + max_chunk + trailer` |
//!
//! ```text
//!  0            drain           fill                 capacity
//!  |  consumed   |    unread     |     spare          |
//!  +-------------+---------------+--------------------+
//! ```
//!
//! The invariant `0 <= drain <= fill <= capacity` holds after every method.
//! Windows never grow once allocated.

use std::ops::Range;

/// Linear buffer with independent write (fill) and read (drain) cursors.
#[derive(Clone, PartialEq, Eq)]
pub struct ByteWindow {
    buf: Box<[u8]>,
    fill: usize,
    drain: usize,
}

impl ByteWindow {
    /// Allocate a zeroed window of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            fill: 0,
            drain: 0,
        }
    }

    /// Total bytes the window can hold.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Fill cursor (bytes written so far).
    pub fn fill(&self) -> usize {
        self.fill
    }

    /// Drain cursor (bytes consumed so far).
    pub fn drain(&self) -> usize {
        self.drain
    }

    /// Bytes written but not yet consumed.
    pub fn unread_len(&self) -> usize {
        self.fill - self.drain
    }

    /// Check if any written bytes remain unconsumed.
    pub fn has_unread(&self) -> bool {
        self.drain < self.fill
    }

    /// Check if nothing has been written since the last reset.
    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    /// Space left after the fill cursor.
    pub fn remaining_capacity(&self) -> usize {
        self.buf.len() - self.fill
    }

    /// The `[0, fill)` region.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.fill]
    }

    /// The `[0, fill)` region, mutable for in-place transforms.
    pub fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.fill]
    }

    /// The `[drain, fill)` region.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.drain..self.fill]
    }

    /// The `[fill, capacity)` region for direct reads into the window.
    ///
    /// Pair with [`ByteWindow::advance_fill`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.fill..]
    }

    /// Record `n` bytes written into [`ByteWindow::spare_mut`].
    pub fn advance_fill(&mut self, n: usize) {
        debug_assert!(n <= self.remaining_capacity());
        self.fill += n.min(self.remaining_capacity());
    }

    /// Record `n` bytes consumed from [`ByteWindow::unread`].
    pub fn advance_drain(&mut self, n: usize) {
        debug_assert!(n <= self.unread_len());
        self.drain += n.min(self.unread_len());
    }

    /// Append as much of `src` as fits. Returns bytes copied.
    pub fn write_at_fill(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining_capacity());
        self.buf[self.fill..self.fill + n].copy_from_slice(&src[..n]);
        self.fill += n;
        n
    }

    /// Copy unread bytes into `dst`, advancing the drain cursor.
    ///
    /// Returns bytes copied: `min(dst.len(), unread_len())`.
    pub fn read_from_drain(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.unread_len());
        dst[..n].copy_from_slice(&self.buf[self.drain..self.drain + n]);
        self.drain += n;
        n
    }

    /// Move unread bytes to offset 0.
    pub fn compact(&mut self) {
        if self.drain == 0 {
            return;
        }
        self.buf.copy_within(self.drain..self.fill, 0);
        self.fill -= self.drain;
        self.drain = 0;
    }

    /// Keep only `range` of the filled region, moved to offset 0.
    ///
    /// Ranges outside `[0, fill)` are clipped.
    pub fn relocate_to_front(&mut self, range: Range<usize>) {
        let end = range.end.min(self.fill);
        let start = range.start.min(end);
        self.buf.copy_within(start..end, 0);
        self.fill = end - start;
        self.drain = 0;
    }

    /// Reset both cursors.
    pub fn clear(&mut self) {
        self.fill = 0;
        self.drain = 0;
    }

    /// Overwrite the window with `src`. Returns `false` if it does not fit.
    pub fn replace(&mut self, src: &[u8]) -> bool {
        if src.len() > self.buf.len() {
            return false;
        }
        self.buf[..src.len()].copy_from_slice(src);
        self.fill = src.len();
        self.drain = 0;
        true
    }

    /// Reset the window to hold exactly `len` bytes and expose them.
    ///
    /// Returns `None` if `len` exceeds the capacity.
    pub fn prepare(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.buf.len() {
            return None;
        }
        self.fill = len;
        self.drain = 0;
        Some(&mut self.buf[..len])
    }
}

impl std::fmt::Debug for ByteWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Contents may be plaintext
        f.debug_struct("ByteWindow")
            .field("capacity", &self.buf.len())
            .field("fill", &self.fill)
            .field("drain", &self.drain)
            .finish()
    }
}
