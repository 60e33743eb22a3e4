//! # Error Handling for feedstore
//!
//! This module defines the error type used throughout the crate. A single
//! enum ([`Error`]) represents every failure mode, from a malformed tuple to a
//! store-level commit conflict.
//!
//! ## Rust Pattern: thiserror
//!
//! The `thiserror` crate derives `std::error::Error` for us:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from `#[from]` attributes
//! - Source chaining works through `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Encoding | Negative integer, truncated tuple | Fix the caller |
//! | Precondition | Double subscribe, unsubscribe when absent | Surface to the application |
//! | Usage | 11-byte cursor, `get_state` inside a transaction | Fix the caller |
//! | Retryable | Commit conflict, transaction too old | Re-run the whole transaction |
//! | Internal | SQLite error, schema mismatch | Log and investigate |
//!
//! Only the retryable category is ever handled inside the crate, and only by
//! the retry loop in [`Store::transact`](crate::storage::Store::transact).
//! Everything else propagates unchanged so that a logical operation never
//! has side effects before its transaction commits.

use thiserror::Error;

use crate::types::Eid;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in feedstore operations.
///
/// # Example
///
/// ```rust,ignore
/// use feedstore::{Error, Result};
///
/// fn example(store: &Store, feeds: &FeedStore) -> Result<()> {
///     match store.transact(|tx| feeds.subscribe(tx, alice, general)) {
///         Err(Error::AlreadySubscribed { .. }) => { /* caller bug */ }
///         other => other?,
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Codec Errors (Fatal to the current operation)
    // =========================================================================

    /// A value could not be encoded into the tuple format.
    ///
    /// # When This Happens
    ///
    /// - Converting a negative or non-integral number into a tuple value
    /// - A decimal whose magnitude does not fit in 8 bytes
    /// - Packing a tuple with an incomplete versionstamp through `pack()`
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Bytes could not be decoded as a tuple.
    ///
    /// # When This Happens
    ///
    /// - Unknown type marker
    /// - Truncated buffer or missing string terminator
    /// - A decoded element has a different type than the caller expected
    #[error("decoding error: {0}")]
    Decoding(String),

    // =========================================================================
    // State-Precondition Errors (Never treated as idempotent no-ops)
    // =========================================================================

    /// `subscribe` was called for a subscription that already exists.
    #[error("{subscriber} is already subscribed to {feed}")]
    AlreadySubscribed {
        /// The subscribing entity
        subscriber: Eid,
        /// The feed
        feed: Eid,
    },

    /// `unsubscribe` was called for a subscription that does not exist.
    #[error("{subscriber} is not subscribed to {feed}")]
    NotSubscribed {
        /// The subscribing entity
        subscriber: Eid,
        /// The feed
        feed: Eid,
    },

    /// An allocation would take a sequence counter past `u64::MAX`.
    ///
    /// The counter is left untouched; wrapping would hand out values that
    /// were already allocated.
    #[error("sequence overflow: counter at {current}, cannot allocate {requested} more")]
    SequenceOverflow {
        /// The counter before the allocation
        current: u64,
        /// How many values were requested
        requested: u64,
    },

    // =========================================================================
    // Usage Errors (Caller bug)
    // =========================================================================

    /// A resume cursor did not have the 12-byte versionstamp width.
    #[error("invalid cursor: expected 12 bytes, got {len}")]
    InvalidCursor {
        /// Length of the cursor that was supplied
        len: usize,
    },

    /// A resume cursor was a versionstamp placeholder, not a committed stamp.
    #[error("invalid cursor: incomplete versionstamp")]
    IncompleteCursor,

    /// An operation that manages its own transaction was called while the
    /// current thread is already inside one.
    #[error("{operation} must be called outside of a transaction")]
    NestedTransaction {
        /// Name of the rejected operation
        operation: &'static str,
    },

    /// A named in-transaction lock was requested while already held by the
    /// same transaction.
    #[error("lock '{name}' is already held by this transaction")]
    LockHeld {
        /// The lock name
        name: String,
    },

    // =========================================================================
    // Retryable Errors (Re-run the whole transaction)
    // =========================================================================

    /// Optimistic concurrency conflict: something this transaction read was
    /// written by a transaction that committed after our read version.
    ///
    /// # Systems Concept: Optimistic Concurrency Control
    ///
    /// Reads never block. At commit time the store compares the transaction's
    /// read conflict ranges against the write ranges of every commit newer
    /// than the read version. Any overlap means the reads may be stale, so the
    /// commit is rejected and the caller re-executes from scratch.
    #[error("transaction conflict: read at version {read_version}, conflicting commit at version {conflicting_version}")]
    Conflict {
        /// The version the transaction read at
        read_version: u64,
        /// The newer commit that wrote into our read set
        conflicting_version: u64,
    },

    /// The commit history needed to validate this transaction is gone.
    #[error("transaction too old: read at version {read_version}, history starts after version {horizon}")]
    TransactionTooOld {
        /// The version the transaction read at
        read_version: u64,
        /// Newest version dropped from the conflict window
        horizon: u64,
    },

    // =========================================================================
    // Internal Errors (Investigate and fix)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// `#[from]` generates `impl From<rusqlite::Error> for Error`, which lets
    /// `?` convert rusqlite errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corruption detected.
    #[error("schema error: {0}")]
    Schema(String),

    /// A background task failed to run to completion.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if re-running the whole transaction may succeed.
    ///
    /// Only store-level concurrency failures qualify. Precondition and usage
    /// errors would fail again on retry, so they are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::TransactionTooOld { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let already = Error::AlreadySubscribed {
            subscriber: Eid::new(1, 10),
            feed: Eid::new(2, 20),
        };
        assert_eq!(already.to_string(), "1:10 is already subscribed to 2:20");

        let cursor = Error::InvalidCursor { len: 11 };
        assert_eq!(cursor.to_string(), "invalid cursor: expected 12 bytes, got 11");

        let conflict = Error::Conflict {
            read_version: 3,
            conflicting_version: 5,
        };
        assert_eq!(
            conflict.to_string(),
            "transaction conflict: read at version 3, conflicting commit at version 5"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Conflict {
            read_version: 1,
            conflicting_version: 2
        }
        .is_retryable());
        assert!(Error::TransactionTooOld {
            read_version: 1,
            horizon: 9
        }
        .is_retryable());

        assert!(!Error::Encoding("negative".into()).is_retryable());
        assert!(!Error::NotSubscribed {
            subscriber: Eid::new(1, 1),
            feed: Eid::new(1, 2),
        }
        .is_retryable());
        assert!(!Error::NestedTransaction { operation: "get_state" }.is_retryable());
    }

    /// Verify that rusqlite errors convert automatically.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
        assert!(!our_err.is_retryable());
    }
}
