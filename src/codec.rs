//! # Binary Tuple Codec
//!
//! This module encodes sequences of scalar values into byte strings whose
//! lexicographic order matches the order of the values themselves. It is the
//! only key and value encoding used by the rest of the crate.
//!
//! ## Wire Format
//!
//! Every element starts with a type marker byte:
//!
//! ```text
//! ┌────────┬──────────────────────────────────────────────────────────┐
//! │ marker │ body                                                      │
//! ├────────┼──────────────────────────────────────────────────────────┤
//! │ 0x00   │ null, no body                                             │
//! │ 0x01   │ byte string, 0x00 escaped as 0x00 0xFF, ends with 0x00    │
//! │ 0x02   │ UTF-8 string, same escaping and terminator                │
//! │ 0x14   │ integer zero, no body                                     │
//! │ 0x14+n │ integer, n (1..=8) big-endian bytes, no leading zero byte │
//! │ 0x26   │ false                                                     │
//! │ 0x27   │ true                                                      │
//! │ 0x33   │ versionstamp, 12 bytes                                    │
//! └────────┴──────────────────────────────────────────────────────────┘
//! ```
//!
//! This is byte-identical to the FoundationDB tuple layer for these types,
//! so keys built here compare correctly against keys any other tuple client
//! produces.
//!
//! ## Why Length-Prefixed Integers Sort Correctly
//!
//! A shorter magnitude always has a smaller marker (`0x14 + n`), so integers
//! of different widths are ordered by the marker byte alone. Integers of the
//! same width have the same marker and big-endian bodies of equal length,
//! which compare numerically under byte order.
//!
//! ## Why Escape 0x00 in Strings?
//!
//! The terminator is a bare `0x00`. Escaping literal zero bytes as
//! `0x00 0xFF` keeps terminator scanning unambiguous, and since `0xFF` is
//! larger than any marker that can follow a terminator, a string that is a
//! prefix of another still sorts first.
//!
//! ## Unsigned Only
//!
//! The integer scheme encodes magnitudes. Negative numbers (and the negative
//! integer markers `0x0C..=0x13` on decode) are rejected rather than given a
//! second encoding, so every integer has exactly one byte representation.

use std::fmt;

use crate::buffer::ByteBuffer;
use crate::error::{Error, Result};
use crate::types::{Decimal, EventId, Versionstamp, VERSIONSTAMP_LEN};

// =============================================================================
// Type Markers
// =============================================================================

const NULL: u8 = 0x00;
const BYTES: u8 = 0x01;
const STRING: u8 = 0x02;
const NEG_INT_START: u8 = 0x0c;
const INT_ZERO: u8 = 0x14;
const POS_INT_END: u8 = 0x1c;
const FALSE: u8 = 0x26;
const TRUE: u8 = 0x27;
const VERSIONSTAMP: u8 = 0x33;

/// Escape byte following a literal `0x00` inside a string body.
const ESCAPE: u8 = 0xff;

/// Largest integer a float converts to without precision loss (2^53 - 1).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

// =============================================================================
// Tuple Values
// =============================================================================

/// One element of a [`Tuple`].
///
/// # Rust Pattern: Closed Sum Type
///
/// Every supported scalar kind is a variant. Anything else simply can't be
/// constructed, so the "unsupported type" failure of a dynamically typed
/// encoder becomes a compile error here. Numeric conversions that can fail
/// (negative or fractional input) go through `TryFrom` and return
/// `Error::Encoding`.
///
/// # Equality
///
/// `Integer(n)` and an integral `Decimal` with the same value are equal,
/// since they encode to identical bytes and decode back as `Integer`.
#[derive(Debug, Clone)]
pub enum TupleValue {
    /// Null, sorts before everything
    Null,
    /// Raw byte string
    Bytes(Vec<u8>),
    /// UTF-8 string, ordered by code point
    String(String),
    /// Non-negative integer up to 64 bits
    Integer(u64),
    /// Arbitrary-precision decimal; must be a non-negative integer below 2^64 to encode
    Decimal(Decimal),
    /// Boolean, `false < true`
    Bool(bool),
    /// Commit-order stamp, possibly incomplete
    Versionstamp(Versionstamp),
}

impl PartialEq for TupleValue {
    fn eq(&self, other: &Self) -> bool {
        use TupleValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bytes(a), Bytes(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Decimal(a), Decimal(b)) => a == b,
            (Integer(a), Decimal(b)) | (Decimal(b), Integer(a)) => {
                b.to_u64().map_or(false, |v| v == *a)
            }
            (Bool(a), Bool(b)) => a == b,
            (Versionstamp(a), Versionstamp(b)) => a == b,
            _ => false,
        }
    }
}

impl From<u64> for TupleValue {
    fn from(v: u64) -> Self {
        TupleValue::Integer(v)
    }
}

impl From<u32> for TupleValue {
    fn from(v: u32) -> Self {
        TupleValue::Integer(u64::from(v))
    }
}

impl From<u16> for TupleValue {
    fn from(v: u16) -> Self {
        TupleValue::Integer(u64::from(v))
    }
}

impl From<u8> for TupleValue {
    fn from(v: u8) -> Self {
        TupleValue::Integer(u64::from(v))
    }
}

impl From<bool> for TupleValue {
    fn from(v: bool) -> Self {
        TupleValue::Bool(v)
    }
}

impl From<&str> for TupleValue {
    fn from(v: &str) -> Self {
        TupleValue::String(v.to_owned())
    }
}

impl From<String> for TupleValue {
    fn from(v: String) -> Self {
        TupleValue::String(v)
    }
}

impl From<&[u8]> for TupleValue {
    fn from(v: &[u8]) -> Self {
        TupleValue::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for TupleValue {
    fn from(v: Vec<u8>) -> Self {
        TupleValue::Bytes(v)
    }
}

impl From<EventId> for TupleValue {
    fn from(v: EventId) -> Self {
        TupleValue::Bytes(v.as_bytes().to_vec())
    }
}

impl From<Decimal> for TupleValue {
    fn from(v: Decimal) -> Self {
        TupleValue::Decimal(v)
    }
}

impl From<Versionstamp> for TupleValue {
    fn from(v: Versionstamp) -> Self {
        TupleValue::Versionstamp(v)
    }
}

impl TryFrom<i64> for TupleValue {
    type Error = Error;

    fn try_from(v: i64) -> Result<Self> {
        u64::try_from(v)
            .map(TupleValue::Integer)
            .map_err(|_| Error::Encoding(format!("negative integer {v} is not supported")))
    }
}

impl TryFrom<f64> for TupleValue {
    type Error = Error;

    fn try_from(v: f64) -> Result<Self> {
        if !v.is_finite() || v.fract() != 0.0 {
            return Err(Error::Encoding(format!("{v} is not an integer")));
        }
        if v < 0.0 {
            return Err(Error::Encoding(format!("negative number {v} is not supported")));
        }
        if v > MAX_SAFE_INTEGER {
            return Err(Error::Encoding(format!(
                "{v} exceeds the safe integer range; use a Decimal"
            )));
        }
        Ok(TupleValue::Integer(v as u64))
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Appends the encoding of one value to `buf`.
///
/// # Errors
///
/// `Error::Encoding` for decimals that are negative, fractional, or wider
/// than 8 bytes.
pub fn encode_value(buf: &mut ByteBuffer, value: &TupleValue) -> Result<()> {
    match value {
        TupleValue::Null => buf.append_byte(NULL),
        TupleValue::Bytes(bytes) => encode_escaped(buf, BYTES, bytes),
        TupleValue::String(s) => encode_escaped(buf, STRING, s.as_bytes()),
        TupleValue::Integer(n) => encode_uint(buf, *n),
        TupleValue::Decimal(d) => encode_uint(buf, d.to_u64()?),
        TupleValue::Bool(false) => buf.append_byte(FALSE),
        TupleValue::Bool(true) => buf.append_byte(TRUE),
        TupleValue::Versionstamp(stamp) => {
            buf.append_byte(VERSIONSTAMP);
            buf.append(&stamp.to_bytes());
        }
    }
    Ok(())
}

/// Marker `0x14 + n`, then the minimal `n`-byte big-endian magnitude.
fn encode_uint(buf: &mut ByteBuffer, n: u64) {
    let width = (8 - n.leading_zeros() / 8) as usize;
    buf.append_byte(INT_ZERO + width as u8);
    buf.append(&n.to_be_bytes()[8 - width..]);
}

fn encode_escaped(buf: &mut ByteBuffer, marker: u8, body: &[u8]) {
    buf.append_byte(marker);
    for &b in body {
        buf.append_byte(b);
        if b == 0x00 {
            buf.append_byte(ESCAPE);
        }
    }
    buf.append_byte(0x00);
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes one value starting at `*cursor` and advances the cursor past it.
///
/// Decoding a tuple of N values is N calls sharing one cursor.
///
/// # Errors
///
/// `Error::Decoding` for an unknown marker, a negative integer marker, a
/// truncated body, a missing string terminator, or invalid UTF-8.
pub fn decode_value(bytes: &[u8], cursor: &mut usize) -> Result<TupleValue> {
    let marker = *bytes
        .get(*cursor)
        .ok_or_else(|| Error::Decoding(format!("unexpected end of input at offset {cursor}")))?;
    *cursor += 1;

    match marker {
        NULL => Ok(TupleValue::Null),
        BYTES => decode_escaped(bytes, cursor).map(TupleValue::Bytes),
        STRING => {
            let raw = decode_escaped(bytes, cursor)?;
            String::from_utf8(raw)
                .map(TupleValue::String)
                .map_err(|e| Error::Decoding(format!("invalid UTF-8 in string: {e}")))
        }
        INT_ZERO..=POS_INT_END => {
            let width = usize::from(marker - INT_ZERO);
            let body = take(bytes, cursor, width)?;
            if body.first() == Some(&0) {
                return Err(Error::Decoding(format!(
                    "non-canonical integer: leading zero byte after marker 0x{marker:02x}"
                )));
            }
            let value = body.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
            Ok(TupleValue::Integer(value))
        }
        NEG_INT_START..=0x13 => Err(Error::Decoding(format!(
            "negative integer marker 0x{marker:02x} is not supported"
        ))),
        FALSE => Ok(TupleValue::Bool(false)),
        TRUE => Ok(TupleValue::Bool(true)),
        VERSIONSTAMP => {
            let body = take(bytes, cursor, VERSIONSTAMP_LEN)?;
            Versionstamp::from_bytes(body).map(TupleValue::Versionstamp)
        }
        other => Err(Error::Decoding(format!(
            "unknown type marker 0x{other:02x} at offset {}",
            *cursor - 1
        ))),
    }
}

fn take<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *cursor + len;
    let body = bytes.get(*cursor..end).ok_or_else(|| {
        Error::Decoding(format!(
            "truncated value: needed {len} bytes at offset {cursor}, have {}",
            bytes.len().saturating_sub(*cursor)
        ))
    })?;
    *cursor = end;
    Ok(body)
}

fn decode_escaped(bytes: &[u8], cursor: &mut usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let b = *bytes
            .get(*cursor)
            .ok_or_else(|| Error::Decoding("unterminated string".to_string()))?;
        *cursor += 1;
        if b != 0x00 {
            out.push(b);
            continue;
        }
        if bytes.get(*cursor) == Some(&ESCAPE) {
            out.push(0x00);
            *cursor += 1;
        } else {
            return Ok(out);
        }
    }
}

// =============================================================================
// Tuples
// =============================================================================

/// An ordered sequence of [`TupleValue`]s.
///
/// # Example
///
/// ```rust
/// use feedstore::codec::Tuple;
///
/// let key = Tuple::new().push(1u32).push("general").push(true);
/// let bytes = key.pack()?;
/// assert_eq!(Tuple::unpack(&bytes)?, key);
/// # Ok::<(), feedstore::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tuple(Vec<TupleValue>);

impl Tuple {
    /// Creates an empty tuple.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a value (builder style).
    pub fn push(mut self, value: impl Into<TupleValue>) -> Self {
        self.0.push(value.into());
        self
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the empty tuple.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Element at `index`, if present.
    pub fn get(&self, index: usize) -> Option<&TupleValue> {
        self.0.get(index)
    }

    /// All elements.
    pub fn values(&self) -> &[TupleValue] {
        &self.0
    }

    /// Appends the encoding of every element to `buf`.
    pub fn encode_into(&self, buf: &mut ByteBuffer) -> Result<()> {
        for value in &self.0 {
            encode_value(buf, value)?;
        }
        Ok(())
    }

    /// Encodes the tuple.
    ///
    /// # Errors
    ///
    /// `Error::Encoding` if any element fails to encode, or if the tuple
    /// holds an incomplete versionstamp (use [`Tuple::pack_with_versionstamp`]).
    pub fn pack(&self) -> Result<Vec<u8>> {
        if self.incomplete_count() > 0 {
            return Err(Error::Encoding(
                "tuple holds an incomplete versionstamp; use pack_with_versionstamp".to_string(),
            ));
        }
        let mut buf = ByteBuffer::new();
        self.encode_into(&mut buf)?;
        Ok(buf.finalize())
    }

    /// Encodes a tuple holding exactly one incomplete versionstamp.
    ///
    /// Returns the bytes and the offset of the stamp's 10-byte commit part,
    /// which the store overwrites at commit time. `prefix` is written first
    /// and included in the offset.
    pub fn pack_with_versionstamp(&self, prefix: &[u8]) -> Result<(Vec<u8>, usize)> {
        let count = self.incomplete_count();
        if count != 1 {
            return Err(Error::Encoding(format!(
                "expected exactly one incomplete versionstamp, found {count}"
            )));
        }

        let mut buf = ByteBuffer::new();
        buf.append(prefix);
        let mut offset = None;
        for value in &self.0 {
            if let TupleValue::Versionstamp(stamp) = value {
                if !stamp.is_complete() {
                    // Marker byte first, then the commit part.
                    offset = Some(buf.len() + 1);
                }
            }
            encode_value(&mut buf, value)?;
        }

        let offset = offset
            .ok_or_else(|| Error::Encoding("incomplete versionstamp not written".to_string()))?;
        Ok((buf.finalize(), offset))
    }

    /// Decodes a full byte string into a tuple.
    pub fn unpack(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0;
        let mut values = Vec::new();
        while cursor < bytes.len() {
            values.push(decode_value(bytes, &mut cursor)?);
        }
        Ok(Self(values))
    }

    fn incomplete_count(&self) -> usize {
        self.0
            .iter()
            .filter(|v| matches!(v, TupleValue::Versionstamp(s) if !s.is_complete()))
            .count()
    }

    // =========================================================================
    // Typed Accessors
    // =========================================================================
    // Records read back from storage are tuples; these turn a type mismatch
    // into a decoding error instead of a panic.

    fn element(&self, index: usize) -> Result<&TupleValue> {
        self.0.get(index).ok_or_else(|| {
            Error::Decoding(format!(
                "tuple has {} elements, wanted index {index}",
                self.0.len()
            ))
        })
    }

    fn mismatch(&self, index: usize, expected: &str) -> Error {
        Error::Decoding(format!(
            "element {index} of {self} is not {expected}"
        ))
    }

    /// Integer at `index`.
    pub fn integer(&self, index: usize) -> Result<u64> {
        match self.element(index)? {
            TupleValue::Integer(n) => Ok(*n),
            TupleValue::Decimal(d) => d.to_u64(),
            _ => Err(self.mismatch(index, "an integer")),
        }
    }

    /// Byte string at `index`.
    pub fn bytes(&self, index: usize) -> Result<&[u8]> {
        match self.element(index)? {
            TupleValue::Bytes(b) => Ok(b),
            _ => Err(self.mismatch(index, "a byte string")),
        }
    }

    /// String at `index`.
    pub fn string(&self, index: usize) -> Result<&str> {
        match self.element(index)? {
            TupleValue::String(s) => Ok(s),
            _ => Err(self.mismatch(index, "a string")),
        }
    }

    /// Boolean at `index`.
    pub fn boolean(&self, index: usize) -> Result<bool> {
        match self.element(index)? {
            TupleValue::Bool(b) => Ok(*b),
            _ => Err(self.mismatch(index, "a boolean")),
        }
    }

    /// Versionstamp at `index`.
    pub fn versionstamp(&self, index: usize) -> Result<Versionstamp> {
        match self.element(index)? {
            TupleValue::Versionstamp(v) => Ok(*v),
            _ => Err(self.mismatch(index, "a versionstamp")),
        }
    }
}

impl From<Vec<TupleValue>> for Tuple {
    fn from(values: Vec<TupleValue>) -> Self {
        Self(values)
    }
}

impl FromIterator<TupleValue> for Tuple {
    fn from_iter<I: IntoIterator<Item = TupleValue>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match value {
                TupleValue::Null => write!(f, "null")?,
                TupleValue::Bytes(b) => write!(f, "b{b:02x?}")?,
                TupleValue::String(s) => write!(f, "{s:?}")?,
                TupleValue::Integer(n) => write!(f, "{n}")?,
                TupleValue::Decimal(d) => write!(f, "{d}")?,
                TupleValue::Bool(b) => write!(f, "{b}")?,
                TupleValue::Versionstamp(v) => write!(f, "vs:{v}")?,
            }
        }
        write!(f, ")")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: impl Into<TupleValue>) -> Vec<u8> {
        let mut buf = ByteBuffer::new();
        encode_value(&mut buf, &value.into()).unwrap();
        buf.finalize()
    }

    fn roundtrip(value: TupleValue) -> TupleValue {
        let mut buf = ByteBuffer::new();
        encode_value(&mut buf, &value).unwrap();
        let bytes = buf.finalize();
        let mut cursor = 0;
        let decoded = decode_value(&bytes, &mut cursor).unwrap();
        assert_eq!(cursor, bytes.len(), "decoder must consume the whole encoding");
        decoded
    }

    /// Golden vectors from the FoundationDB tuple layer.
    #[test]
    fn test_golden_vectors() {
        assert_eq!(encode(TupleValue::Null), vec![0x00]);
        assert_eq!(encode(false), vec![0x26]);
        assert_eq!(encode(true), vec![0x27]);

        assert_eq!(encode(0u64), vec![0x14]);
        assert_eq!(encode(1u64), vec![0x15, 0x01]);
        assert_eq!(encode(255u64), vec![0x15, 0xff]);
        assert_eq!(encode(256u64), vec![0x16, 0x01, 0x00]);
        assert_eq!(encode(65_535u64), vec![0x16, 0xff, 0xff]);
        assert_eq!(encode(65_536u64), vec![0x17, 0x01, 0x00, 0x00]);
        assert_eq!(
            encode(u64::MAX),
            vec![0x1c, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );

        assert_eq!(encode(""), vec![0x02, 0x00]);
        assert_eq!(encode("hello"), vec![0x02, b'h', b'e', b'l', b'l', b'o', 0x00]);
        assert_eq!(encode("a\0b"), vec![0x02, b'a', 0x00, 0xff, b'b', 0x00]);
        assert_eq!(encode("é"), vec![0x02, 0xc3, 0xa9, 0x00]);
        assert_eq!(encode(vec![0x00u8, 0x01]), vec![0x01, 0x00, 0xff, 0x01, 0x00]);

        assert_eq!(encode(Decimal::parse("256").unwrap()), vec![0x16, 0x01, 0x00]);
        assert_eq!(encode(Decimal::parse("0").unwrap()), vec![0x14]);
    }

    #[test]
    fn test_tuple_golden_vector() {
        let packed = Tuple::new().push("foo").push(1u64).push(TupleValue::Null).pack().unwrap();
        assert_eq!(packed, vec![0x02, b'f', b'o', b'o', 0x00, 0x15, 0x01, 0x00]);
    }

    #[test]
    fn test_roundtrip_all_types() {
        let values = vec![
            TupleValue::Null,
            TupleValue::Bool(false),
            TupleValue::Bool(true),
            TupleValue::Integer(0),
            TupleValue::Integer(1),
            TupleValue::Integer(0x0102_0304),
            TupleValue::Integer(u64::MAX),
            TupleValue::String(String::new()),
            TupleValue::String("hello\0world\0".to_string()),
            TupleValue::String("日本語".to_string()),
            TupleValue::Bytes(vec![0x00, 0xff, 0x00, 0x00]),
            TupleValue::Decimal(Decimal::parse("12345678901234").unwrap()),
            TupleValue::Versionstamp(Versionstamp::from_commit(42, 0, 7)),
        ];
        for value in values {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn test_decimal_decodes_as_equal_integer() {
        let d = TupleValue::Decimal(Decimal::parse("1000.00").unwrap());
        let decoded = roundtrip(d.clone());
        assert!(matches!(decoded, TupleValue::Integer(1000)));
        assert_eq!(decoded, d);
    }

    #[test]
    fn test_integer_order_preserved() {
        let mut samples: Vec<u64> = vec![0, 1, 2, 127, 128, 255, 256, 257, 65_535, 65_536];
        for shift in 0..64 {
            let p = 1u64 << shift;
            samples.extend([p - 1, p, p.saturating_add(1)]);
        }
        samples.push(u64::MAX);
        samples.sort_unstable();
        samples.dedup();

        for pair in samples.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!(encode(a) < encode(b), "order broken between {a} and {b}");
        }
    }

    #[test]
    fn test_decimal_order_preserved() {
        let samples = ["0", "9", "10", "255.0", "256", "4294967296", "18446744073709551615"];
        for pair in samples.windows(2) {
            let a = encode(Decimal::parse(pair[0]).unwrap());
            let b = encode(Decimal::parse(pair[1]).unwrap());
            assert!(a < b, "order broken between {} and {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_string_order_preserved() {
        let mut samples = vec!["", "\0", "\0\0", "a", "a\0", "a\0b", "ab", "b", "z", "é", "日", "😀"];
        samples.sort_unstable();
        for pair in samples.windows(2) {
            assert!(
                encode(pair[0]) < encode(pair[1]),
                "order broken between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_tuple_order_is_elementwise() {
        let a = Tuple::new().push(1u64).push("b").pack().unwrap();
        let b = Tuple::new().push(1u64).push("b").push(0u64).pack().unwrap();
        let c = Tuple::new().push(2u64).pack().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_numeric_conversion_errors() {
        assert!(matches!(TupleValue::try_from(-1i64), Err(Error::Encoding(_))));
        assert!(matches!(TupleValue::try_from(1.5f64), Err(Error::Encoding(_))));
        assert!(matches!(TupleValue::try_from(-2.0f64), Err(Error::Encoding(_))));
        assert!(matches!(TupleValue::try_from(f64::NAN), Err(Error::Encoding(_))));
        assert!(matches!(TupleValue::try_from(1e300f64), Err(Error::Encoding(_))));
        assert_eq!(TupleValue::try_from(42.0f64).unwrap(), TupleValue::Integer(42));
        assert_eq!(TupleValue::try_from(7i64).unwrap(), TupleValue::Integer(7));
    }

    #[test]
    fn test_decimal_encoding_errors() {
        let mut buf = ByteBuffer::new();
        for bad in ["-1", "0.5", "18446744073709551616"] {
            let value = TupleValue::Decimal(Decimal::parse(bad).unwrap());
            assert!(
                matches!(encode_value(&mut buf, &value), Err(Error::Encoding(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_decode_errors() {
        let cases: [&[u8]; 9] = [
            &[],                 // nothing to decode
            &[0x15, 0x00],       // zero with a one-byte body
            &[0x16, 0x00, 0x01], // leading zero byte
            &[0x03],             // unknown marker
            &[0x13, 0xfe],       // negative integer
            &[0x16, 0x01],       // truncated integer body
            &[0x02, b'a', b'b'], // missing terminator
            &[0x02, 0xff, 0x00], // invalid UTF-8
            &[0x33, 0x00, 0x01], // truncated versionstamp
        ];
        for bytes in cases {
            let mut cursor = 0;
            assert!(
                matches!(decode_value(bytes, &mut cursor), Err(Error::Decoding(_))),
                "{bytes:02x?} should fail to decode"
            );
        }
    }

    #[test]
    fn test_shared_cursor_decodes_sequence() {
        let bytes = Tuple::new().push("x").push(300u64).push(true).pack().unwrap();
        let mut cursor = 0;
        assert_eq!(decode_value(&bytes, &mut cursor).unwrap(), TupleValue::from("x"));
        assert_eq!(decode_value(&bytes, &mut cursor).unwrap(), TupleValue::Integer(300));
        assert_eq!(decode_value(&bytes, &mut cursor).unwrap(), TupleValue::Bool(true));
        assert_eq!(cursor, bytes.len());
    }

    #[test]
    fn test_pack_with_versionstamp_offset() {
        let tuple = Tuple::new().push(5u64).push(Versionstamp::incomplete(2));
        assert!(tuple.pack().is_err());

        let prefix = [0xaa, 0xbb];
        let (bytes, offset) = tuple.pack_with_versionstamp(&prefix).unwrap();
        // prefix (2) + integer (2) + marker (1)
        assert_eq!(offset, 5);
        assert_eq!(&bytes[offset..offset + 10], &[0xff; 10]);
        assert_eq!(&bytes[offset + 10..], &[0x00, 0x02]);

        assert!(Tuple::new().push(1u64).pack_with_versionstamp(&[]).is_err());
    }

    #[test]
    fn test_typed_accessors() {
        let stamp = Versionstamp::from_commit(9, 0, 1);
        let t = Tuple::new().push(vec![1u8, 2]).push(5u64).push(stamp).push(true).push("s");
        assert_eq!(t.bytes(0).unwrap(), &[1, 2]);
        assert_eq!(t.integer(1).unwrap(), 5);
        assert_eq!(t.versionstamp(2).unwrap(), stamp);
        assert!(t.boolean(3).unwrap());
        assert_eq!(t.string(4).unwrap(), "s");

        assert!(matches!(t.integer(0), Err(Error::Decoding(_))));
        assert!(matches!(t.integer(9), Err(Error::Decoding(_))));
    }
}
