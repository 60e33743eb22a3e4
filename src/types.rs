//! # Domain Types for feedstore
//!
//! This module defines the value types that flow through the storage layer:
//! entity references, event ids, commit-order stamps and decimals.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! As elsewhere in the crate, primitives are wrapped in single-purpose types:
//!
//! - **Type safety**: an [`EventId`] can't be passed where a subscriber key is expected
//! - **Width invariants**: an [`EventId`] is always 16 bytes, a [`Versionstamp`] always 12
//! - **Encapsulation**: validation happens once, at construction
//!
//! ## Invariants
//!
//! - [`Versionstamp`]: byte order equals commit order; complete stamps are unique per store
//! - [`EventId`]: exactly 16 random bytes, unique per posted event
//! - [`Decimal`]: equality is numeric (`1.50 == 1.5`)

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// =============================================================================
// Entity Identity
// =============================================================================

/// A typed entity reference `{kind, id}`.
///
/// Feeds and subscribers share this namespace: the same `Eid` can be a feed in
/// one call and a subscriber in another. In the key space both fields are
/// written as tuple integers, so feeds of one kind sort together.
///
/// # Example
///
/// ```rust
/// use feedstore::types::Eid;
///
/// let chat = Eid::new(1, 2);
/// assert_eq!(chat.to_string(), "1:2");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Eid {
    /// Entity kind (user, chat, organization, ...)
    pub kind: u32,
    /// Entity id within its kind
    pub id: u64,
}

impl Eid {
    /// Creates a new entity reference.
    pub const fn new(kind: u32, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// =============================================================================
// Event Identity
// =============================================================================

/// Width of an [`EventId`] in bytes. Load-bearing for compatibility.
pub const EVENT_ID_LEN: usize = 16;

/// A 16-byte random identifier assigned to every posted event.
///
/// # Why Random?
///
/// The event's `seq` is only final once the posting transaction commits (a
/// conflicting post retries and gets a new seq). The id is generated fresh on
/// every attempt and has no ordering meaning, so the id index never becomes a
/// write hot spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId([u8; EVENT_ID_LEN]);

impl EventId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Wraps raw bytes.
    pub const fn from_bytes(bytes: [u8; EVENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses an id read back from storage.
    ///
    /// # Errors
    ///
    /// `Error::Decoding` if `bytes` is not exactly 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; EVENT_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::Decoding(format!(
                "event id must be {EVENT_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; EVENT_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// =============================================================================
// Versionstamp (Commit-Order Stamp)
// =============================================================================

/// Total width of a versionstamp in bytes.
pub const VERSIONSTAMP_LEN: usize = 12;

/// Width of the commit part of a versionstamp in bytes.
pub const TX_VERSION_LEN: usize = 10;

/// Commit part of an incomplete versionstamp.
const INCOMPLETE_TX_VERSION: [u8; TX_VERSION_LEN] = [0xff; TX_VERSION_LEN];

/// A 12-byte commit-order stamp.
///
/// # Layout
///
/// ```text
/// ┌──────────────────────────┬────────────┬──────────────┐
/// │ commit version (8, BE)   │ batch (2)  │ user (2, BE) │
/// └──────────────────────────┴────────────┴──────────────┘
///  \_____________ assigned at commit ____/ \_ chosen by _/
///                                            the writer
/// ```
///
/// The first 10 bytes are only known once the writing transaction commits.
/// Until then a writer uses an *incomplete* stamp (commit part all `0xFF`)
/// and asks the store to substitute the real value at commit time. The last
/// two bytes let a single transaction write several distinct stamps.
///
/// # Ordering
///
/// The derived `Ord` compares the commit part first, then the user part,
/// which is exactly byte order. Complete stamps therefore sort in commit
/// order, and any complete stamp sorts before an incomplete one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Versionstamp {
    tx_version: [u8; TX_VERSION_LEN],
    user_version: u16,
}

impl Versionstamp {
    /// Creates a complete stamp from its raw parts.
    pub const fn complete(tx_version: [u8; TX_VERSION_LEN], user_version: u16) -> Self {
        Self {
            tx_version,
            user_version,
        }
    }

    /// Creates a placeholder to be filled in at commit time.
    pub const fn incomplete(user_version: u16) -> Self {
        Self {
            tx_version: INCOMPLETE_TX_VERSION,
            user_version,
        }
    }

    /// Builds the commit part from a store commit version and batch order.
    pub fn from_commit(commit_version: u64, batch_order: u16, user_version: u16) -> Self {
        let mut tx_version = [0u8; TX_VERSION_LEN];
        tx_version[..8].copy_from_slice(&commit_version.to_be_bytes());
        tx_version[8..].copy_from_slice(&batch_order.to_be_bytes());
        Self::complete(tx_version, user_version)
    }

    /// Returns false for placeholders.
    pub fn is_complete(&self) -> bool {
        self.tx_version != INCOMPLETE_TX_VERSION
    }

    /// The 10-byte commit part.
    pub fn tx_version(&self) -> &[u8; TX_VERSION_LEN] {
        &self.tx_version
    }

    /// The store commit version encoded in the first 8 bytes.
    pub fn commit_version(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.tx_version[..8]);
        u64::from_be_bytes(raw)
    }

    /// The 2-byte in-transaction index.
    pub fn user_version(&self) -> u16 {
        self.user_version
    }

    /// Serializes to the 12-byte wire form.
    pub fn to_bytes(&self) -> [u8; VERSIONSTAMP_LEN] {
        let mut out = [0u8; VERSIONSTAMP_LEN];
        out[..TX_VERSION_LEN].copy_from_slice(&self.tx_version);
        out[TX_VERSION_LEN..].copy_from_slice(&self.user_version.to_be_bytes());
        out
    }

    /// Parses the 12-byte wire form.
    ///
    /// # Errors
    ///
    /// `Error::InvalidCursor` for any other length. Cursors handed to
    /// `fetch_after` go through here, and a wrong width is a caller bug.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != VERSIONSTAMP_LEN {
            return Err(Error::InvalidCursor { len: bytes.len() });
        }
        let mut tx_version = [0u8; TX_VERSION_LEN];
        tx_version.copy_from_slice(&bytes[..TX_VERSION_LEN]);
        let user_version = u16::from_be_bytes([bytes[10], bytes[11]]);
        Ok(Self::complete(tx_version, user_version))
    }
}

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.to_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// =============================================================================
// Decimal
// =============================================================================

/// Largest scale for which `10^scale` fits in an `i128`.
const MAX_POW10_SCALE: u32 = 38;

/// An arbitrary-precision decimal: `mantissa * 10^-scale`.
///
/// Only non-negative integral decimals that fit in 8 bytes can be encoded
/// into a tuple; everything else is rejected by the codec with an encoding
/// error rather than being rounded or truncated.
///
/// # Equality
///
/// Equality is numeric: `Decimal::parse("1.50") == Decimal::parse("1.5")`.
/// Both sides are normalized (trailing fractional zeros stripped) first.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    mantissa: i128,
    scale: u32,
}

impl Decimal {
    /// Creates `mantissa * 10^-scale`.
    pub const fn new(mantissa: i128, scale: u32) -> Self {
        Self { mantissa, scale }
    }

    /// Creates an integral decimal.
    pub const fn from_integer(value: u64) -> Self {
        Self {
            mantissa: value as i128,
            scale: 0,
        }
    }

    /// Parses a plain decimal literal such as `"42"`, `"-0.001"` or `"123.450"`.
    ///
    /// # Errors
    ///
    /// `Error::Encoding` for malformed literals or values outside `i128`.
    pub fn parse(text: &str) -> Result<Self> {
        let malformed = || Error::Encoding(format!("malformed decimal literal '{text}'"));

        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(malformed());
        }

        // Trailing fractional zeros don't change the value; they are put back
        // below only as far as the mantissa has room.
        let significant = frac_part.trim_end_matches('0');
        let mut mantissa: i128 = 0;
        for ch in int_part.chars().chain(significant.chars()) {
            let digit = ch.to_digit(10).ok_or_else(malformed)?;
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(digit)))
                .ok_or_else(|| Error::Encoding(format!("decimal '{text}' out of range")))?;
        }

        let mut scale = u32::try_from(significant.len()).map_err(|_| malformed())?;
        for _ in significant.len()..frac_part.len() {
            match mantissa.checked_mul(10) {
                Some(widened) => {
                    mantissa = widened;
                    scale += 1;
                }
                None => break,
            }
        }
        Ok(Self {
            mantissa: if negative { -mantissa } else { mantissa },
            scale,
        })
    }

    /// Returns true for values below zero.
    pub fn is_negative(&self) -> bool {
        self.mantissa < 0
    }

    /// Strips trailing fractional zeros: `(1500, 3)` becomes `(15, 1)`.
    pub fn normalized(&self) -> (i128, u32) {
        let (mut mantissa, mut scale) = (self.mantissa, self.scale);
        if mantissa == 0 {
            return (0, 0);
        }
        while scale > 0 && mantissa % 10 == 0 {
            mantissa /= 10;
            scale -= 1;
        }
        (mantissa, scale)
    }

    /// Converts to the unsigned magnitude the tuple codec writes.
    ///
    /// # Errors
    ///
    /// `Error::Encoding` if the value is negative, has a fractional part, or
    /// needs more than 8 bytes.
    pub fn to_u64(&self) -> Result<u64> {
        let (mantissa, scale) = self.normalized();
        if mantissa < 0 {
            return Err(Error::Encoding(format!("negative decimal {self} is not supported")));
        }
        if scale > 0 {
            return Err(Error::Encoding(format!("decimal {self} is not an integer")));
        }
        u64::try_from(mantissa)
            .map_err(|_| Error::Encoding(format!("decimal {self} does not fit in 8 bytes")))
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Decimal {}

impl FromStr for Decimal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        if self.scale > MAX_POW10_SCALE {
            return write!(f, "{}e-{}", self.mantissa, self.scale);
        }
        let pow = 10i128.pow(self.scale);
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let abs = self.mantissa.unsigned_abs();
        let pow = pow.unsigned_abs();
        write!(
            f,
            "{sign}{}.{:0width$}",
            abs / pow,
            abs % pow,
            width = self.scale as usize
        )
    }
}

// =============================================================================
// Feed Records
// =============================================================================

/// One event as stored in a feed.
///
/// Created exactly once per successful post and immutable afterwards. The
/// same `(id, seq, date)` triple is reachable through the time, seq and id
/// indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedEvent {
    /// Random 16-byte id
    pub id: EventId,
    /// Per-feed sequence number, starting at 1
    pub seq: u64,
    /// Commit-order stamp of the posting transaction
    pub date: Versionstamp,
}

/// A resume position in commit order.
///
/// Returned by `get_state` and stored with every subscription. Feed events
/// whose `date` is greater than the cursor were committed after it.
pub type FeedCursor = Versionstamp;

/// Fan-out targets produced by a post.
///
/// The store only computes who should hear about an event; delivery is the
/// caller's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOut {
    /// The feed keeps an explicit subscriber list; these are its members.
    Direct(Vec<Eid>),
    /// The feed has too many subscribers to enumerate and needs an external
    /// fan-out mechanism.
    Jumbo,
}

impl FanOut {
    /// The explicit targets, empty for a jumbo feed.
    pub fn targets(&self) -> &[Eid] {
        match self {
            FanOut::Direct(targets) => targets,
            FanOut::Jumbo => &[],
        }
    }

    /// Returns true for a jumbo feed.
    pub fn is_jumbo(&self) -> bool {
        matches!(self, FanOut::Jumbo)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versionstamp_roundtrip_and_order() {
        let a = Versionstamp::from_commit(7, 0, 0);
        let b = Versionstamp::from_commit(7, 0, 1);
        let c = Versionstamp::from_commit(8, 0, 0);

        assert!(a < b && b < c);
        assert!(a.to_bytes() < b.to_bytes() && b.to_bytes() < c.to_bytes());
        assert_eq!(Versionstamp::from_bytes(&b.to_bytes()).unwrap(), b);
        assert_eq!(c.commit_version(), 8);
        assert_eq!(b.user_version(), 1);
    }

    #[test]
    fn test_versionstamp_rejects_wrong_width() {
        let err = Versionstamp::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::InvalidCursor { len: 10 }));
    }

    #[test]
    fn test_incomplete_versionstamp() {
        let placeholder = Versionstamp::incomplete(3);
        assert!(!placeholder.is_complete());
        assert!(Versionstamp::from_commit(u64::MAX - 1, 0, 0) < placeholder);
    }

    #[test]
    fn test_event_id_width() {
        let id = EventId::random();
        assert_eq!(EventId::from_slice(id.as_bytes()).unwrap(), id);
        assert!(EventId::from_slice(&[1, 2, 3]).is_err());
        assert_eq!(id.to_string().len(), 32);
    }

    #[test]
    fn test_decimal_parse_and_normalize() {
        let d = Decimal::parse("123.4500").unwrap();
        assert_eq!(d.normalized(), (12345, 2));
        assert_eq!(d, Decimal::parse("123.45").unwrap());
        assert_eq!(d.to_string(), "123.4500");

        assert_eq!(Decimal::parse("-0.001").unwrap().to_string(), "-0.001");
        assert!(Decimal::parse("").is_err());
        assert!(Decimal::parse("1.2.3").is_err());
        assert!(Decimal::parse("12a").is_err());
    }

    #[test]
    fn test_decimal_parse_long_zero_fraction() {
        let text = format!("1.{}", "0".repeat(40));
        let d = Decimal::parse(&text).unwrap();
        assert_eq!(d.normalized(), (1, 0));
        assert_eq!(d.to_u64().unwrap(), 1);
        assert_eq!(d, Decimal::from_integer(1));

        // Significant digits past i128 still fail.
        assert!(Decimal::parse(&format!("1.{}1", "0".repeat(40))).is_err());
    }

    #[test]
    fn test_decimal_to_u64() {
        assert_eq!(Decimal::parse("42.000").unwrap().to_u64().unwrap(), 42);
        assert_eq!(Decimal::parse("18446744073709551615").unwrap().to_u64().unwrap(), u64::MAX);

        assert!(Decimal::parse("18446744073709551616").unwrap().to_u64().is_err());
        assert!(Decimal::parse("-1").unwrap().to_u64().is_err());
        assert!(Decimal::parse("0.5").unwrap().to_u64().is_err());
    }
}
