//! # Growable Byte Buffer
//!
//! An append-only byte accumulator used by the tuple encoder. Capacity grows
//! by doubling, so appending N bytes one at a time costs O(N) amortized.
//!
//! ```text
//! capacity: 8          capacity: 16 (after an append that would overflow)
//! ┌────────┐           ┌────────────────┐
//! │xxxxx...│  ──────►  │xxxxxxxxx.......│
//! └────────┘           └────────────────┘
//!   used=5               used=9
//! ```
//!
//! The buffer is write-once-then-read: [`ByteBuffer::finalize`] consumes it
//! and hands back exactly the written prefix.

/// Initial capacity for [`ByteBuffer::new`].
///
/// Most packed keys are a handful of tuple elements, well under 64 bytes.
pub const DEFAULT_CAPACITY: usize = 64;

/// A growable owned byte region with explicit `used`/`capacity` tracking.
///
/// # Rust Pattern: Vec as Backing Store
///
/// The backing `Vec` is always zero-filled up to the full capacity and
/// `used` marks the written prefix. Growth is decided here rather than by
/// `Vec`'s own strategy so the doubling policy is explicit.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
    used: usize,
}

impl ByteBuffer {
    /// Creates a buffer with [`DEFAULT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            used: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.used
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Currently allocated capacity.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Appends a slice, growing capacity if the write would overflow.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.data[self.used..self.used + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
    }

    /// Appends a single byte.
    pub fn append_byte(&mut self, byte: u8) {
        self.ensure(1);
        self.data[self.used] = byte;
        self.used += 1;
    }

    /// Consumes the buffer and returns exactly the written prefix.
    pub fn finalize(mut self) -> Vec<u8> {
        self.data.truncate(self.used);
        self.data
    }

    /// Doubles capacity until `additional` more bytes fit.
    fn ensure(&mut self, additional: usize) {
        let required = self.used + additional;
        if required <= self.data.len() {
            return;
        }

        let mut capacity = self.data.len().max(1);
        while capacity < required {
            capacity *= 2;
        }
        self.data.resize(capacity, 0);
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
