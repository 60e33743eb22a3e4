//! # feedstore - Event Feeds over an Ordered Transactional Store
//!
//! feedstore is the storage layer of a chat/organization backend. It provides:
//!
//! - **An order-preserving tuple codec**: keys that sort the way their values do
//! - **Event feeds**: per-entity append-only feeds with subscriber tracking
//! - **Jumbo feeds**: explicit subscriber lists that give way to external fan-out
//! - **Sequence counters**: monotonic per-subscriber counters, optionally gated by liveness
//! - **A cached read-through subspace**: per-transaction caching with one flush at commit
//!
//! All of it runs inside transactions of an ordered key-value store with
//! optimistic concurrency, shipped here as a SQLite-backed implementation.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │              (FeedDb: spawn_blocking over the store)            │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   FeedStore        SequenceRepository        CachedSubspace     │
//! │   (feeds, jumbo)   (counters, liveness)      (per-tx cache)     │
//! │                        LockSpace (advisory)                     │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │  Tuple / Subspace keys
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Store / Transaction                           │
//! │   snapshot reads · conflict detection · atomic ops · stamps     │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 SQLite (multi-version rows, WAL)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Order preservation**: `a < b` implies `pack(a) < pack(b)` bytewise
//! 2. **Commit order**: versionstamps strictly increase across commits, never reused
//! 3. **Gap-free seqs**: a feed's events are numbered `1..=N` in commit order
//! 4. **Jumbo is terminal**: a feed never returns to keeping an explicit list
//! 5. **No partial effects**: nothing a failed or retried transaction did is visible
//!
//! ## Module Organization
//!
//! - [`error`]: Custom error types for all failure modes
//! - [`buffer`]: Growable byte buffer used by the encoder
//! - [`types`]: Domain types (Eid, EventId, Versionstamp, Decimal, ...)
//! - [`codec`]: Order-preserving tuple encoding
//! - [`subspace`]: Key prefixes on top of the codec
//! - [`schema`]: SQLite DDL and database initialization
//! - [`storage`]: The transactional key-value store
//! - [`cache`]: Cached read-through subspace
//! - [`lock`]: In-transaction advisory locks
//! - [`sequence`]: Sequence repository
//! - [`feed`]: Event feed store
//! - [`api`]: Async API (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for feedstore operations.
///
/// A single error enum covers codec, precondition, usage, retryable and
/// internal failures.
pub mod error;

/// Growable byte buffer.
pub mod buffer;

/// Domain types.
///
/// Entity references, event ids, commit-order stamps and decimals, each a
/// newtype with its width or numeric invariant enforced at construction.
pub mod types;

/// Order-preserving tuple encoding.
///
/// Byte-compatible with the FoundationDB tuple layer for the supported
/// types, so packed keys sort in tuple order.
pub mod codec;

/// Key prefixes on top of the tuple codec.
pub mod subspace;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// The ordered transactional key-value store.
///
/// Multi-version rows in SQLite, snapshot reads, optimistic conflict
/// detection at commit, atomic add/max, versionstamps and a retry loop.
pub mod storage;

/// Per-transaction cached read-through subspace.
pub mod cache;

/// Named advisory locks scoped to one transaction.
pub mod lock;

/// Per-subscriber monotonic counters.
pub mod sequence;

/// Event feeds with subscriber tracking and jumbo fan-out.
pub mod feed;

/// Async API for feedstore.
///
/// The main entry point is [`FeedDb`](api::FeedDb).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================
// Users can write `use feedstore::Error` instead of `use feedstore::error::Error`.

pub use api::{FeedDb, FeedDbConfig};
pub use cache::CachedSubspace;
pub use codec::{Tuple, TupleValue};
pub use error::{Error, Result};
pub use feed::{FeedConfig, FeedSettings, FeedStore, PostReceipt};
pub use lock::LockSpace;
pub use schema::Database;
pub use sequence::{LockingSequenceRepository, SequenceRepository};
pub use storage::{
    AtomicOp, CommitInfo, KeyValue, RangeOptions, Store, StoreConfig, Transaction,
    VersionstampHandle,
};
pub use subspace::Subspace;

// Re-export commonly used types from the types module
pub use types::{Decimal, Eid, EventId, FanOut, FeedCursor, FeedEvent, Versionstamp};
