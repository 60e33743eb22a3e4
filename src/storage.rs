//! # Ordered Transactional Key-Value Store
//!
//! This module provides the store that every other component runs inside:
//! byte-ordered keys, range scans, serializable optimistic transactions,
//! atomic add/max, and commit-order stamps (versionstamps) that can be used
//! as key material before the commit that assigns them has happened.
//!
//! ## Design: Multi-Version Rows + Commit-Time Validation
//!
//! ```text
//!   Transaction A (read_version = 7)          Store
//!   ─────────────────────────────────         ──────────────────────────────
//!   get(k1)  ──── newest row ≤ 7 ──────────►  kv_versions (SQLite)
//!   set(k2)  ──── buffered locally
//!   commit() ───────────────────────────────► 1. run before-commit hooks
//!                                             2. for every commit v > 7:
//!                                                does v's write set overlap
//!                                                A's read set?  → Conflict
//!                                             3. write rows at version 8
//!                                             4. resolve versionstamps
//! ```
//!
//! Reads never block and never see uncommitted data: each transaction reads a
//! fixed snapshot (its read version) overlaid with its own buffered writes.
//! Writes are only validated at commit. A transaction whose reads were
//! overwritten by a newer commit fails with [`Error::Conflict`] and the caller
//! re-runs it, which [`Store::transact`] does automatically.
//!
//! ## Snapshot Reads
//!
//! `snapshot_get` and `RangeOptions::as_snapshot` read the same snapshot but
//! record no read conflict. They are for advisory reads that must not force a
//! retry. When such a read feeds a decision, pair it with
//! [`Transaction::add_read_conflict_key`] on the key that guards the decision.
//!
//! ## Versionstamps
//!
//! A versionstamp's 10-byte commit part is only known inside the commit. A
//! writer packs an incomplete stamp into a key or value, tells the store the
//! byte offset, and the store substitutes the real bytes while writing rows.
//! Every substitution in one transaction uses the same commit part, so all
//! index entries written by one `post` agree on the same stamp.
//!
//! ## Invariants
//!
//! - Commit versions strictly increase and are never reused (persisted high-water mark)
//! - A committed transaction's reads were not overwritten between its read and commit versions
//! - Nothing a transaction buffers becomes visible before it commits
//! - Read-only transactions always commit and get no commit version

use std::any::{Any, TypeId};
use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::schema::{self, Database};
use crate::subspace::key_after;
use crate::types::{Versionstamp, TX_VERSION_LEN};

// =============================================================================
// Configuration
// =============================================================================

/// Default number of retries [`Store::transact`] makes after a retryable error.
pub const DEFAULT_MAX_RETRIES: usize = 50;

/// Default base delay between retries, in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1;

/// Upper bound for a single retry delay, in milliseconds.
const MAX_RETRY_BACKOFF_MS: u64 = 64;

/// Default number of recent commits kept for conflict validation.
///
/// A transaction whose read version is older than the oldest retained commit
/// fails with [`Error::TransactionTooOld`].
pub const DEFAULT_CONFLICT_WINDOW: usize = 100_000;

/// Configuration for a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Retries after a retryable error before giving up.
    pub max_retries: usize,

    /// Base delay between retries; doubles per attempt, with jitter.
    pub retry_backoff: Duration,

    /// Recent commits retained for conflict validation.
    pub conflict_window: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            conflict_window: DEFAULT_CONFLICT_WINDOW,
        }
    }
}

// =============================================================================
// SQL
// =============================================================================

const READ_KEY_AT: &str = "SELECT value FROM kv_versions
     WHERE key = ?1 AND version <= ?2
     ORDER BY version DESC LIMIT 1";

const READ_KEY_LATEST: &str = "SELECT value FROM kv_versions
     WHERE key = ?1
     ORDER BY version DESC LIMIT 1";

const SCAN_FORWARD: &str = "SELECT key, value FROM kv_versions AS v
     WHERE key >= ?1 AND key < ?2 AND value IS NOT NULL
       AND version = (SELECT MAX(version) FROM kv_versions WHERE key = v.key AND version <= ?3)
     ORDER BY key ASC LIMIT ?4";

const SCAN_REVERSE: &str = "SELECT key, value FROM kv_versions AS v
     WHERE key >= ?1 AND key < ?2 AND value IS NOT NULL
       AND version = (SELECT MAX(version) FROM kv_versions WHERE key = v.key AND version <= ?3)
     ORDER BY key DESC LIMIT ?4";

const PUT_ROW: &str = "INSERT OR REPLACE INTO kv_versions (key, version, value) VALUES (?1, ?2, ?3)";

/// Tombstones every key that is live at the newest version within `[?1, ?2)`.
const CLEAR_RANGE: &str = "INSERT OR REPLACE INTO kv_versions (key, version, value)
     SELECT key, ?3, NULL FROM kv_versions AS v
     WHERE key >= ?1 AND key < ?2 AND value IS NOT NULL
       AND version = (SELECT MAX(version) FROM kv_versions WHERE key = v.key)";

/// Rows shadowed by a newer row that every live reader can already see.
const GC_SHADOWED: &str = "DELETE FROM kv_versions
     WHERE version < ?1 AND EXISTS (
         SELECT 1 FROM kv_versions AS newer
         WHERE newer.key = kv_versions.key
           AND newer.version > kv_versions.version
           AND newer.version <= ?1)";

/// Tombstones that are the newest row of their key and visible to every live reader.
const GC_TOMBSTONES: &str = "DELETE FROM kv_versions
     WHERE value IS NULL AND version <= ?1 AND NOT EXISTS (
         SELECT 1 FROM kv_versions AS newer
         WHERE newer.key = kv_versions.key
           AND newer.version > kv_versions.version)";

// =============================================================================
// Public Value Types
// =============================================================================

/// A key/value pair returned by a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key bytes
    pub key: Vec<u8>,
    /// The value bytes
    pub value: Vec<u8>,
}

/// Options for [`Transaction::get_range`].
///
/// # Example
///
/// ```rust,ignore
/// // The 10 highest keys in the range, without recording a read conflict.
/// let rows = tx.get_range(&begin, &end, RangeOptions::new().with_limit(10).reversed().as_snapshot())?;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    /// Maximum rows to return; `None` is unlimited.
    pub limit: Option<usize>,
    /// Scan from the end of the range backwards.
    pub reverse: bool,
    /// Record no read conflict.
    pub snapshot: bool,
}

impl RangeOptions {
    /// Unlimited forward conflicting scan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of rows returned.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Scans backwards.
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Records no read conflict.
    pub fn as_snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }
}

/// Atomic mutations applied at commit time against the newest committed value.
///
/// Both operate on little-endian unsigned integers whose width is the operand
/// length; a missing value counts as zero. This matches the FoundationDB
/// atomic operations of the same names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    /// Wrapping addition. Adding the two's complement of `n` subtracts `n`.
    Add,
    /// Keeps the larger of the stored value and the operand.
    Max,
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    /// The commit version, or `None` for a read-only transaction.
    pub version: Option<u64>,
}

impl CommitInfo {
    /// The 10-byte commit part of versionstamps written by this commit.
    pub fn tx_version(&self) -> Option<[u8; TX_VERSION_LEN]> {
        self.version
            .map(|v| *Versionstamp::from_commit(v, 0, 0).tx_version())
    }
}

/// A handle to the commit part of a transaction's versionstamp.
///
/// # Deferred Resolution
///
/// Obtained before commit, readable after. A handle from an attempt that
/// failed to commit stays unresolved forever.
#[derive(Debug, Clone, Default)]
pub struct VersionstampHandle(Arc<OnceLock<[u8; TX_VERSION_LEN]>>);

impl VersionstampHandle {
    /// The commit part, once the owning transaction has committed.
    pub fn get(&self) -> Option<[u8; TX_VERSION_LEN]> {
        self.0.get().copied()
    }

    /// The complete stamp for one of the transaction's user versions.
    pub fn resolve(&self, user_version: u16) -> Option<Versionstamp> {
        self.get()
            .map(|tx_version| Versionstamp::complete(tx_version, user_version))
    }
}

// =============================================================================
// Atomic Operation Semantics
// =============================================================================

/// Applies an atomic operation to an existing value.
pub fn apply_atomic(op: AtomicOp, existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8> {
    let byte_at = |i: usize| existing.and_then(|e| e.get(i)).copied().unwrap_or(0);

    match op {
        AtomicOp::Add => {
            let mut out = vec![0u8; operand.len()];
            let mut carry = 0u16;
            for (i, &b) in operand.iter().enumerate() {
                let sum = u16::from(byte_at(i)) + u16::from(b) + carry;
                out[i] = sum as u8;
                carry = sum >> 8;
            }
            out
        }
        AtomicOp::Max => {
            let Some(_) = existing else {
                return operand.to_vec();
            };
            let current: Vec<u8> = (0..operand.len()).map(byte_at).collect();
            // Little-endian: the most significant byte is last.
            match current.iter().rev().cmp(operand.iter().rev()) {
                Ordering::Greater => current,
                _ => operand.to_vec(),
            }
        }
    }
}

/// Decodes a little-endian unsigned value (missing bytes are zero, extra bytes ignored).
pub fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let n = bytes.len().min(8);
    raw[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(raw)
}

/// Decodes a little-endian two's complement value.
pub fn le_i64(bytes: &[u8]) -> i64 {
    le_u64(bytes) as i64
}

// =============================================================================
// Key Ranges
// =============================================================================

/// A half-open key range `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyRange {
    begin: Vec<u8>,
    end: Vec<u8>,
}

impl KeyRange {
    fn new(begin: &[u8], end: &[u8]) -> Self {
        Self {
            begin: begin.to_vec(),
            end: end.to_vec(),
        }
    }

    fn point(key: &[u8]) -> Self {
        Self {
            begin: key.to_vec(),
            end: key_after(key),
        }
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.begin.as_slice() <= key && key < self.end.as_slice()
    }

    fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

// =============================================================================
// Store State
// =============================================================================

/// Write set of one committed transaction, kept for validating later commits.
struct CommitRecord {
    version: u64,
    writes: Vec<KeyRange>,
}

/// Everything behind the store lock.
struct StoreState {
    conn: Connection,

    /// Newest committed version. Persisted; never decreases.
    last_version: u64,

    /// Recent commits, oldest first.
    recent: VecDeque<CommitRecord>,

    /// Newest version dropped from `recent`. Transactions reading below it
    /// can't be validated.
    horizon: u64,

    /// Read versions of open transactions, with counts.
    active_reads: BTreeMap<u64, usize>,
}

impl StoreState {
    /// Drops history no open transaction needs, and anything beyond `window`.
    fn trim_history(&mut self, window: usize) {
        let oldest_reader = self.active_reads.keys().next().copied();
        while let Some(front) = self.recent.front() {
            let unneeded = oldest_reader.map_or(true, |r| front.version <= r);
            if !unneeded && self.recent.len() <= window {
                break;
            }
            self.horizon = self.horizon.max(front.version);
            self.recent.pop_front();
        }
    }
}

struct StoreInner {
    state: Mutex<StoreState>,
    config: StoreConfig,
}

// =============================================================================
// Transaction Scope Tracking
// =============================================================================

thread_local! {
    /// Depth of [`Store::transact`] calls on this thread.
    static TRANSACT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// RAII marker for "this thread is running a transaction closure".
struct TransactScope;

impl TransactScope {
    fn enter() -> Self {
        TRANSACT_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for TransactScope {
    fn drop(&mut self) {
        TRANSACT_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Returns true while the current thread is inside a [`Store::transact`] closure.
///
/// Operations that need a dedicated commit of their own use this to reject
/// being nested inside a caller's transaction.
pub fn in_transaction() -> bool {
    TRANSACT_DEPTH.with(|d| d.get() > 0)
}

// =============================================================================
// Store
// =============================================================================

/// The transactional key-value store.
///
/// # Thread Safety
///
/// `Store` is `Clone + Send + Sync`; clones share the same database. SQLite
/// access is serialized behind one lock, held only for the duration of a
/// single read or a single commit, never across a whole transaction.
///
/// # Example
///
/// ```rust
/// use feedstore::Store;
///
/// let store = Store::open_in_memory()?;
/// store.transact(|tx| {
///     tx.set(b"hello", b"world");
///     Ok(())
/// })?;
///
/// let value = store.transact(|tx| tx.get(b"hello"))?;
/// assert_eq!(value.as_deref(), Some(&b"world"[..]));
/// # Ok::<(), feedstore::Error>(())
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) a file-backed store with the default configuration.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::with_config(Database::open(path)?, StoreConfig::default())
    }

    /// Creates an in-memory store with the default configuration.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_config(Database::open_in_memory()?, StoreConfig::default())
    }

    /// Creates a store over an initialized database.
    pub fn with_config(db: Database, config: StoreConfig) -> Result<Self> {
        let conn = db.into_connection();
        let last_version = schema::load_last_version(&conn)?;
        debug!(last_version, "store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    conn,
                    last_version,
                    recent: VecDeque::new(),
                    // Commits before this process started are not in `recent`.
                    horizon: last_version,
                    active_reads: BTreeMap::new(),
                }),
                config,
            }),
        })
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// The newest committed version.
    pub fn last_version(&self) -> u64 {
        self.inner.state.lock().last_version
    }

    /// Starts a transaction reading at the newest committed version.
    pub fn begin(&self) -> Transaction {
        let read_version = {
            let mut state = self.inner.state.lock();
            let version = state.last_version;
            *state.active_reads.entry(version).or_insert(0) += 1;
            version
        };
        Transaction::new(self.clone(), read_version)
    }

    /// Runs `f` in a transaction and commits, retrying on retryable errors.
    ///
    /// # Retry Semantics
    ///
    /// `f` may run several times. Every attempt gets a fresh transaction, so
    /// nothing from a failed attempt leaks into the next one. Only
    /// [`Error::is_retryable`] errors are retried, from `f` or from commit.
    /// `f` must not have side effects outside the transaction.
    pub fn transact<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Transaction) -> Result<T>,
    {
        let _scope = TransactScope::enter();
        let max_retries = self.inner.config.max_retries;
        let mut attempt = 0usize;

        loop {
            let mut tx = self.begin();
            let outcome = match f(&mut tx) {
                Ok(value) => tx.commit().map(|_| value),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "retrying transaction");
                    std::thread::sleep(self.backoff(attempt));
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(attempts = attempt + 1, error = %e, "transaction retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Exponential backoff with full jitter.
    pub(crate) fn backoff(&self, attempt: usize) -> Duration {
        let base = self.inner.config.retry_backoff.as_millis() as u64;
        let exp = base
            .saturating_mul(1u64 << attempt.min(16))
            .min(MAX_RETRY_BACKOFF_MS);
        Duration::from_millis(rand::thread_rng().gen_range(0..=exp))
    }

    /// Deletes row versions that no open or future transaction can read.
    ///
    /// Returns the number of rows removed. Visible state is unchanged.
    pub fn collect_garbage(&self) -> Result<usize> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let horizon = state
            .active_reads
            .keys()
            .next()
            .copied()
            .unwrap_or(state.last_version);

        let sql_tx = state.conn.transaction()?;
        let shadowed = sql_tx.execute(GC_SHADOWED, params![horizon as i64])?;
        let tombstones = sql_tx.execute(GC_TOMBSTONES, params![horizon as i64])?;
        sql_tx.commit()?;

        info!(horizon, shadowed, tombstones, "garbage collected row versions");
        Ok(shadowed + tombstones)
    }

    /// Number of stored row versions, including tombstones.
    pub fn row_count(&self) -> Result<u64> {
        let state = self.inner.state.lock();
        let count: i64 = state
            .conn
            .query_row("SELECT COUNT(*) FROM kv_versions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // =========================================================================
    // Internal Read/Commit Paths
    // =========================================================================

    fn read_at(&self, key: &[u8], version: u64) -> Result<Option<Vec<u8>>> {
        let state = self.inner.state.lock();
        let mut stmt = state.conn.prepare_cached(READ_KEY_AT)?;
        let row: Option<Option<Vec<u8>>> = stmt
            .query_row(params![key, version as i64], |row| row.get(0))
            .optional()?;
        Ok(row.flatten())
    }

    fn scan_at(
        &self,
        begin: &[u8],
        end: &[u8],
        version: u64,
        limit: Option<usize>,
        reverse: bool,
    ) -> Result<Vec<KeyValue>> {
        let state = self.inner.state.lock();
        let sql = if reverse { SCAN_REVERSE } else { SCAN_FORWARD };
        // SQLite treats a negative LIMIT as unlimited.
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));

        let mut stmt = state.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![begin, end, version as i64, limit], |row| {
            Ok(KeyValue {
                key: row.get(0)?,
                value: row.get(1)?,
            })
        })?;
        let collected = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(collected)
    }

    fn release_read_version(&self, version: u64) {
        let mut state = self.inner.state.lock();
        if let Some(count) = state.active_reads.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                state.active_reads.remove(&version);
            }
        }
    }

    /// Validates and applies a transaction's writes. Returns the commit version.
    fn commit_writes(&self, tx: &Transaction) -> Result<u64> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        if tx.read_version < state.horizon {
            return Err(Error::TransactionTooOld {
                read_version: tx.read_version,
                horizon: state.horizon,
            });
        }

        for record in state.recent.iter().rev() {
            if record.version <= tx.read_version {
                break;
            }
            let overlaps = record
                .writes
                .iter()
                .any(|w| tx.read_conflicts.iter().any(|r| r.intersects(w)));
            if overlaps {
                debug!(
                    read_version = tx.read_version,
                    conflicting_version = record.version,
                    "commit rejected: read set overwritten"
                );
                return Err(Error::Conflict {
                    read_version: tx.read_version,
                    conflicting_version: record.version,
                });
            }
        }

        let version = state.last_version + 1;
        let stamp = Versionstamp::from_commit(version, 0, 0);
        let mut writes = Vec::with_capacity(tx.writes.len() + tx.cleared.len() + tx.stamped.len());

        let sql_tx = state.conn.transaction()?;
        for range in &tx.cleared {
            sql_tx.execute(
                CLEAR_RANGE,
                params![range.begin, range.end, version as i64],
            )?;
            writes.push(range.clone());
        }
        for (key, write) in &tx.writes {
            let committed = match write.base {
                Base::Unchanged => sql_tx
                    .query_row(READ_KEY_LATEST, params![key], |row| {
                        row.get::<_, Option<Vec<u8>>>(0)
                    })
                    .optional()?
                    .flatten(),
                Base::Value(_) => None,
            };
            let value = write.apply(committed);
            sql_tx.execute(PUT_ROW, params![key, version as i64, value])?;
            writes.push(KeyRange::point(key));
        }
        for stamped in &tx.stamped {
            let (key, value) = stamped.resolve(stamp.tx_version());
            sql_tx.execute(PUT_ROW, params![key, version as i64, value])?;
            writes.push(KeyRange::point(&key));
        }
        schema::store_last_version(&sql_tx, version)?;
        sql_tx.commit()?;

        state.last_version = version;
        state.recent.push_back(CommitRecord { version, writes });
        state.trim_history(self.inner.config.conflict_window);

        debug!(
            version,
            read_version = tx.read_version,
            keys = tx.writes.len(),
            ranges = tx.cleared.len(),
            stamped = tx.stamped.len(),
            "committed"
        );
        Ok(version)
    }
}

// =============================================================================
// Buffered Writes
// =============================================================================

/// What a transaction knows about a key's value before its atomic ops.
#[derive(Debug, Clone)]
enum Base {
    /// Not written or cleared by this transaction: ops apply to the committed value.
    Unchanged,
    /// Set (`Some`) or cleared (`None`) by this transaction.
    Value(Option<Vec<u8>>),
}

/// A buffered write to one key.
#[derive(Debug, Clone)]
struct KeyWrite {
    base: Base,
    ops: Vec<(AtomicOp, Vec<u8>)>,
}

impl KeyWrite {
    fn value(value: Option<Vec<u8>>) -> Self {
        Self {
            base: Base::Value(value),
            ops: Vec::new(),
        }
    }

    /// Final value given the committed value (ignored unless `Unchanged`).
    fn apply(&self, committed: Option<Vec<u8>>) -> Option<Vec<u8>> {
        let mut current = match &self.base {
            Base::Unchanged => committed,
            Base::Value(v) => v.clone(),
        };
        for (op, operand) in &self.ops {
            current = Some(apply_atomic(*op, current.as_deref(), operand));
        }
        current
    }
}

/// Where the commit part of a versionstamp goes.
#[derive(Debug, Clone, Copy)]
enum StampTarget {
    Key(usize),
    Value(usize),
}

/// A write whose key or value holds an incomplete versionstamp.
#[derive(Debug, Clone)]
struct StampedWrite {
    key: Vec<u8>,
    value: Vec<u8>,
    target: StampTarget,
}

impl StampedWrite {
    fn resolve(&self, tx_version: &[u8; TX_VERSION_LEN]) -> (Vec<u8>, Vec<u8>) {
        let mut key = self.key.clone();
        let mut value = self.value.clone();
        match self.target {
            StampTarget::Key(offset) => {
                key[offset..offset + TX_VERSION_LEN].copy_from_slice(tx_version)
            }
            StampTarget::Value(offset) => {
                value[offset..offset + TX_VERSION_LEN].copy_from_slice(tx_version)
            }
        }
        (key, value)
    }
}

/// A hook run just before a transaction commits.
type BeforeCommit = Box<dyn FnOnce(&mut Transaction) -> Result<()> + Send>;

// =============================================================================
// Transaction
// =============================================================================

/// One optimistic transaction.
///
/// # Lifecycle
///
/// ```text
/// Store::begin() ──► reads / buffered writes ──► commit() ──► CommitInfo
///                                       │
///                                       └──► drop without commit = rollback
/// ```
///
/// Dropping a transaction without committing discards every buffered write;
/// nothing reaches the database before [`Transaction::commit`].
///
/// # Transaction-Scoped State
///
/// Components that need per-transaction memory (read caches, held locks)
/// keep it in [`Transaction::scoped`]. It lives exactly as long as the
/// transaction and is never shared with another one.
pub struct Transaction {
    store: Store,
    read_version: u64,
    writes: BTreeMap<Vec<u8>, KeyWrite>,
    cleared: Vec<KeyRange>,
    stamped: Vec<StampedWrite>,
    read_conflicts: Vec<KeyRange>,
    next_user_version: u32,
    stamp: VersionstampHandle,
    hooks: Vec<BeforeCommit>,
    scoped: HashMap<(TypeId, String), Box<dyn Any + Send>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("read_version", &self.read_version)
            .field("writes", &self.writes.len())
            .field("cleared", &self.cleared.len())
            .field("stamped", &self.stamped.len())
            .field("read_conflicts", &self.read_conflicts.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    fn new(store: Store, read_version: u64) -> Self {
        Self {
            store,
            read_version,
            writes: BTreeMap::new(),
            cleared: Vec::new(),
            stamped: Vec::new(),
            read_conflicts: Vec::new(),
            next_user_version: 0,
            stamp: VersionstampHandle::default(),
            hooks: Vec::new(),
            scoped: HashMap::new(),
        }
    }

    /// The snapshot version this transaction reads at.
    pub fn read_version(&self) -> u64 {
        self.read_version
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads a key, recording a read conflict.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_key(key, false)
    }

    /// Reads a key without recording a read conflict.
    pub fn snapshot_get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_key(key, true)
    }

    fn read_key(&mut self, key: &[u8], snapshot: bool) -> Result<Option<Vec<u8>>> {
        match self.writes.get(key) {
            // Fully determined by our own writes: no conflict needed.
            Some(write) if matches!(write.base, Base::Value(_)) => return Ok(write.apply(None)),
            Some(_) => {}
            None if self.is_cleared(key) => return Ok(None),
            None => {}
        }

        if !snapshot {
            self.read_conflicts.push(KeyRange::point(key));
        }
        let committed = self.store.read_at(key, self.read_version)?;
        Ok(match self.writes.get(key) {
            Some(write) => write.apply(committed),
            None => committed,
        })
    }

    /// Reads the live keys in `[begin, end)`, merged with this transaction's writes.
    ///
    /// # Read Conflicts
    ///
    /// Unless `opts.snapshot` is set, the conflict range covers what the scan
    /// actually observed: the whole range, or only up to the last returned key
    /// when the limit cut the scan short. A write past the cut doesn't
    /// invalidate this read.
    pub fn get_range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        opts: RangeOptions,
    ) -> Result<Vec<KeyValue>> {
        if begin >= end || opts.limit == Some(0) {
            return Ok(Vec::new());
        }

        let range = KeyRange::new(begin, end);
        let touches_writes = self
            .writes
            .range(begin.to_vec()..end.to_vec())
            .next()
            .is_some()
            || self.cleared.iter().any(|c| c.intersects(&range));

        let rows = if touches_writes {
            self.merged_range(begin, end, opts)?
        } else {
            self.store
                .scan_at(begin, end, self.read_version, opts.limit, opts.reverse)?
        };

        if !opts.snapshot {
            let observed = match (opts.limit, rows.last()) {
                (Some(limit), Some(last)) if rows.len() == limit => {
                    if opts.reverse {
                        KeyRange::new(&last.key, end)
                    } else {
                        KeyRange::new(begin, &key_after(&last.key))
                    }
                }
                _ => range,
            };
            self.read_conflicts.push(observed);
        }
        Ok(rows)
    }

    /// Committed rows overlaid with buffered sets, clears and atomic ops.
    fn merged_range(&self, begin: &[u8], end: &[u8], opts: RangeOptions) -> Result<Vec<KeyValue>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .store
            .scan_at(begin, end, self.read_version, None, false)?
            .into_iter()
            .map(|kv| (kv.key, kv.value))
            .collect();

        for cleared in &self.cleared {
            merged.retain(|k, _| !cleared.contains(k));
        }
        for (key, write) in self.writes.range(begin.to_vec()..end.to_vec()) {
            let committed = merged.remove(key);
            if let Some(value) = write.apply(committed) {
                merged.insert(key.clone(), value);
            }
        }

        let limit = opts.limit.unwrap_or(usize::MAX);
        let to_kv = |(key, value): (Vec<u8>, Vec<u8>)| KeyValue { key, value };
        Ok(if opts.reverse {
            merged.into_iter().rev().take(limit).map(to_kv).collect()
        } else {
            merged.into_iter().take(limit).map(to_kv).collect()
        })
    }

    fn is_cleared(&self, key: &[u8]) -> bool {
        self.cleared.iter().any(|r| r.contains(key))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Buffers `key = value`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.drop_stamped_value(key);
        self.writes
            .insert(key.to_vec(), KeyWrite::value(Some(value.to_vec())));
    }

    /// Buffers a delete of `key`.
    pub fn clear(&mut self, key: &[u8]) {
        self.drop_stamped_value(key);
        self.writes.insert(key.to_vec(), KeyWrite::value(None));
    }

    /// Forgets a pending versionstamped value for `key`; the newer write wins.
    fn drop_stamped_value(&mut self, key: &[u8]) {
        self.stamped
            .retain(|s| !(matches!(s.target, StampTarget::Value(_)) && s.key == key));
    }

    /// Buffers a delete of every key in `[begin, end)`.
    pub fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
        if begin >= end {
            return;
        }
        let shadowed: Vec<Vec<u8>> = self
            .writes
            .range(begin.to_vec()..end.to_vec())
            .map(|(k, _)| k.clone())
            .collect();
        for key in shadowed {
            self.writes.remove(&key);
        }
        let range = KeyRange::new(begin, end);
        self.stamped
            .retain(|s| !(matches!(s.target, StampTarget::Value(_)) && range.contains(&s.key)));
        self.cleared.push(range);
    }

    /// Buffers an atomic operation. Records no read conflict.
    pub fn atomic_op(&mut self, key: &[u8], op: AtomicOp, operand: &[u8]) {
        let cleared = self.is_cleared(key);
        self.writes
            .entry(key.to_vec())
            .or_insert_with(|| KeyWrite {
                base: if cleared {
                    Base::Value(None)
                } else {
                    Base::Unchanged
                },
                ops: Vec::new(),
            })
            .ops
            .push((op, operand.to_vec()));
    }

    /// Atomically adds a signed delta to an 8-byte little-endian counter.
    pub fn add(&mut self, key: &[u8], delta: i64) {
        self.atomic_op(key, AtomicOp::Add, &delta.to_le_bytes());
    }

    /// Atomically raises an 8-byte little-endian value to at least `value`.
    pub fn max(&mut self, key: &[u8], value: u64) {
        self.atomic_op(key, AtomicOp::Max, &value.to_le_bytes());
    }

    /// Marks `key` as read without reading it.
    pub fn add_read_conflict_key(&mut self, key: &[u8]) {
        self.read_conflicts.push(KeyRange::point(key));
    }

    /// Marks `[begin, end)` as read without reading it.
    pub fn add_read_conflict_range(&mut self, begin: &[u8], end: &[u8]) {
        if begin < end {
            self.read_conflicts.push(KeyRange::new(begin, end));
        }
    }

    // =========================================================================
    // Versionstamps
    // =========================================================================

    /// Allocates the next in-transaction index for an incomplete versionstamp.
    ///
    /// # Errors
    ///
    /// `Error::Encoding` after 65536 allocations in one transaction.
    pub fn allocate_user_version(&mut self) -> Result<u16> {
        let next = u16::try_from(self.next_user_version).map_err(|_| {
            Error::Encoding("more than 65536 versionstamps in one transaction".to_string())
        })?;
        self.next_user_version += 1;
        Ok(next)
    }

    /// A handle that yields this transaction's commit stamp after commit.
    pub fn versionstamp(&self) -> VersionstampHandle {
        self.stamp.clone()
    }

    /// Buffers a write whose key holds an incomplete versionstamp at `offset`.
    ///
    /// The key is not visible to reads in this transaction.
    pub fn set_versionstamped_key(&mut self, key: Vec<u8>, offset: usize, value: &[u8]) -> Result<()> {
        check_stamp_offset(&key, offset)?;
        self.stamped.push(StampedWrite {
            key,
            value: value.to_vec(),
            target: StampTarget::Key(offset),
        });
        Ok(())
    }

    /// Buffers a write whose value holds an incomplete versionstamp at `offset`.
    ///
    /// The value is not visible to reads in this transaction. It replaces any
    /// earlier buffered write to `key`, and a later `set`, `clear` or
    /// `clear_range` covering `key` replaces it.
    pub fn set_versionstamped_value(&mut self, key: &[u8], value: Vec<u8>, offset: usize) -> Result<()> {
        check_stamp_offset(&value, offset)?;
        self.drop_stamped_value(key);
        self.writes.remove(key);
        self.stamped.push(StampedWrite {
            key: key.to_vec(),
            value,
            target: StampTarget::Value(offset),
        });
        Ok(())
    }

    // =========================================================================
    // Hooks and Scoped State
    // =========================================================================

    /// Registers a hook that runs at the start of [`Transaction::commit`].
    ///
    /// Hooks may read, write and register further hooks; all of them run
    /// before validation.
    pub fn before_commit<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut Transaction) -> Result<()> + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Transaction-scoped state of type `T` under `name`, created on first use.
    pub fn scoped<T: Default + Send + 'static>(&mut self, name: &str) -> &mut T {
        let slot = self
            .scoped
            .entry((TypeId::of::<T>(), name.to_owned()))
            .or_insert_with(|| Box::new(T::default()));
        match slot.downcast_mut::<T>() {
            Some(state) => state,
            None => unreachable!("scoped slots are keyed by TypeId"),
        }
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Returns true if nothing has been written.
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty() && self.cleared.is_empty() && self.stamped.is_empty()
    }

    /// Runs before-commit hooks, validates and applies the writes.
    ///
    /// # Errors
    ///
    /// - `Error::Conflict` / `Error::TransactionTooOld` (retryable)
    /// - any error returned by a hook
    /// - `Error::Sqlite` if the write fails
    pub fn commit(mut self) -> Result<CommitInfo> {
        loop {
            let hooks = std::mem::take(&mut self.hooks);
            if hooks.is_empty() {
                break;
            }
            debug!(count = hooks.len(), "running before-commit hooks");
            for hook in hooks {
                hook(&mut self)?;
            }
        }

        if self.is_read_only() {
            return Ok(CommitInfo { version: None });
        }

        let version = self.store.commit_writes(&self)?;
        let info = CommitInfo {
            version: Some(version),
        };
        if let Some(tx_version) = info.tx_version() {
            // A transaction commits at most once, so the cell is always empty here.
            let _ = self.stamp.0.set(tx_version);
        }
        Ok(info)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.store.release_read_version(self.read_version);
    }
}

fn check_stamp_offset(bytes: &[u8], offset: usize) -> Result<()> {
    if offset + TX_VERSION_LEN > bytes.len() {
        return Err(Error::Encoding(format!(
            "versionstamp offset {offset} out of bounds for {} bytes",
            bytes.len()
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
