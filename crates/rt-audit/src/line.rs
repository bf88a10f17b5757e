//! Line reconstruction from a raw output byte stream.
//!
//! Shell output arrives as an arbitrary byte stream: escape sequences,
//! carriage returns, partial lines split across reads. The accumulator keeps
//! only printable bytes and cuts a record at every newline, so the audit log
//! sees one entry per visible output line regardless of how the bytes were
//! chunked on the way in.

use std::fmt;
use std::ops::Deref;

/// Initial capacity of the line buffer, in bytes.
pub const INITIAL_CAPACITY: usize = 128;

/// Fixed amount the line buffer grows by whenever it is full.
pub const GROWTH_INCREMENT: usize = 128;

/// A completed, non-empty line of session output.
///
/// Contents are restricted to printable ASCII (`0x20..=0x7E`), so the record
/// is always valid UTF-8 and never contains a NUL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord(String);

impl LineRecord {
    /// Consume the record, returning its text.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Deref for LineRecord {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LineRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Buffers printable output bytes and emits a [`LineRecord`] per line.
///
/// The buffer has no upper bound: a line is as long as the child makes it.
/// Capacity starts at [`INITIAL_CAPACITY`] and grows by
/// [`GROWTH_INCREMENT`]; it never shrinks, including across flushes.
pub struct LineAccumulator {
    buf: Vec<u8>,
}

impl LineAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Consume one output byte.
    ///
    /// Returns a record when `byte` is a newline and the buffer holds a
    /// non-empty line. Printable bytes are buffered; everything else is
    /// dropped.
    pub fn feed(&mut self, byte: u8) -> Option<LineRecord> {
        if byte == b'\n' {
            return self.flush();
        }

        if is_printable(byte) {
            if self.buf.len() == self.buf.capacity() {
                self.buf.reserve_exact(GROWTH_INCREMENT);
            }
            self.buf.push(byte);
        }

        None
    }

    /// Feed every byte of `data`, passing each completed record to `emit`.
    ///
    /// Produces exactly the records that byte-by-byte [`feed`](Self::feed)
    /// calls would.
    pub fn feed_all<F>(&mut self, data: &[u8], mut emit: F)
    where
        F: FnMut(LineRecord),
    {
        for &byte in data {
            if let Some(record) = self.feed(byte) {
                emit(record);
            }
        }
    }

    /// End of consumption: emit whatever partial line is pending.
    pub fn finish(&mut self) -> Option<LineRecord> {
        self.flush()
    }

    /// Bytes buffered since the last flush.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes buffered since the last flush.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current capacity of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    fn flush(&mut self) -> Option<LineRecord> {
        if self.buf.is_empty() {
            return None;
        }

        // Only printable ASCII is ever buffered.
        let line: String = self.buf.iter().map(|&b| b as char).collect();
        self.buf.clear();
        Some(LineRecord(line))
    }
}

impl Default for LineAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// `isprint(3)` in the C locale.
fn is_printable(byte: u8) -> bool {
    matches!(byte, 0x20..=0x7e)
}
