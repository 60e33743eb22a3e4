//! # Subspaces
//!
//! A subspace is a packed tuple prefix that partitions the key space. Each
//! component owns one, and every key it writes is `prefix ++ pack(tuple)`:
//!
//! ```text
//! feeds subspace ("feed")
//! ├── (1, 2, 0, 0)          counter of feed 1:2
//! ├── (1, 2, 1, <stamp>)    time index entry
//! └── (1, 2, 3, <id>)       id index entry
//! ```
//!
//! Because tuple encoding preserves order, `[prefix ++ 0x00, prefix ++ 0xFF)`
//! covers exactly the keys packed under that prefix, which is what
//! [`Subspace::range`] returns.

use crate::buffer::ByteBuffer;
use crate::codec::Tuple;
use crate::error::{Error, Result};

/// A key prefix plus tuple packing helpers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    /// Creates a subspace from a tuple prefix.
    pub fn new(prefix: &Tuple) -> Result<Self> {
        Ok(Self {
            prefix: prefix.pack()?,
        })
    }

    /// Creates a subspace from raw prefix bytes.
    pub fn from_bytes(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The raw prefix.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// A nested subspace: `self.prefix ++ pack(tuple)`.
    pub fn subspace(&self, tuple: &Tuple) -> Result<Self> {
        Ok(Self {
            prefix: self.pack(tuple)?,
        })
    }

    /// Packs `tuple` under this prefix.
    pub fn pack(&self, tuple: &Tuple) -> Result<Vec<u8>> {
        let mut buf = ByteBuffer::with_capacity(self.prefix.len() + 32);
        buf.append(&self.prefix);
        tuple.encode_into(&mut buf)?;
        Ok(buf.finalize())
    }

    /// Packs a tuple holding one incomplete versionstamp under this prefix.
    ///
    /// Returns the key and the offset of the stamp's commit part, ready for
    /// [`Transaction::set_versionstamped_key`](crate::storage::Transaction::set_versionstamped_key).
    pub fn pack_with_versionstamp(&self, tuple: &Tuple) -> Result<(Vec<u8>, usize)> {
        tuple.pack_with_versionstamp(&self.prefix)
    }

    /// Decodes a key written under this prefix.
    ///
    /// # Errors
    ///
    /// `Error::Decoding` if `key` does not start with the prefix.
    pub fn unpack(&self, key: &[u8]) -> Result<Tuple> {
        let rest = key.strip_prefix(self.prefix.as_slice()).ok_or_else(|| {
            Error::Decoding(format!("key {key:02x?} is outside subspace {:02x?}", self.prefix))
        })?;
        Tuple::unpack(rest)
    }

    /// Returns true if `key` lies under this prefix.
    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// `[begin, end)` covering every tuple packed under this prefix.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut begin = self.prefix.clone();
        begin.push(0x00);
        let mut end = self.prefix.clone();
        end.push(0xff);
        (begin, end)
    }
}

/// The smallest key strictly greater than `key`.
pub fn key_after(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0x00);
    next
}
