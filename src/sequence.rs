//! # Sequence Repository
//!
//! Per-subscriber monotonic counters, optionally gated by a liveness
//! timestamp.
//!
//! ## Key Layout
//!
//! ```text
//! <repository subspace>
//! ├── (subscriber, 0) → online-until   8-byte little-endian, updated with atomic max
//! └── (subscriber, 1) → (seq,)         tuple-encoded counter
//! ```
//!
//! The online-until value is stored in the store's atomic-op format rather
//! than as a tuple, so `refresh_online` can be a blind max-update that never
//! moves the expiry backwards.
//!
//! ## Systems Concept: Linearizable Allocation Through Conflicts
//!
//! `allocate_seq` is a plain read-modify-write. Two transactions allocating
//! on the same subscriber both read the counter, so whichever commits second
//! conflicts and re-runs. No increment is ever lost and no value is ever
//! handed out twice.
//!
//! ## Two Ways to Guard Allocation
//!
//! - [`SequenceRepository::allocate_seq_if_online`] checks liveness and
//!   allocates in the same transaction. The liveness read is conflicting, so
//!   a concurrent `mark_offline` or `refresh_online` forces a retry instead
//!   of an allocation against a stale answer.
//! - [`LockingSequenceRepository`] wraps allocation in a named
//!   in-transaction lock, which catches two call sites allocating for the
//!   same subscriber inside one caller-level transaction.

use std::fmt::Write as _;

use crate::codec::Tuple;
use crate::error::{Error, Result};
use crate::lock::LockSpace;
use crate::storage::{le_u64, Transaction};
use crate::subspace::Subspace;

/// Discriminator of the online-until key.
const ONLINE_UNTIL: u64 = 0;

/// Discriminator of the counter key.
const COUNTER: u64 = 1;

/// Monotonic counters keyed by opaque subscriber bytes.
#[derive(Debug, Clone)]
pub struct SequenceRepository {
    space: Subspace,
}

impl SequenceRepository {
    /// Creates a repository over `space`.
    pub fn new(space: Subspace) -> Self {
        Self { space }
    }

    fn key(&self, subscriber: &[u8], discriminator: u64) -> Result<Vec<u8>> {
        self.space
            .pack(&Tuple::new().push(subscriber).push(discriminator))
    }

    fn decode_counter(value: Option<Vec<u8>>) -> Result<u64> {
        match value {
            Some(bytes) => Tuple::unpack(&bytes)?.integer(0),
            None => Ok(0),
        }
    }

    fn write_counter(&self, tx: &mut Transaction, subscriber: &[u8], seq: u64) -> Result<()> {
        let key = self.key(subscriber, COUNTER)?;
        tx.set(&key, &Tuple::new().push(seq).pack()?);
        Ok(())
    }

    // =========================================================================
    // Counter
    // =========================================================================

    /// The current counter, `0` if nothing was ever allocated.
    pub fn current_seq(&self, tx: &mut Transaction, subscriber: &[u8]) -> Result<u64> {
        let key = self.key(subscriber, COUNTER)?;
        Self::decode_counter(tx.get(&key)?)
    }

    /// Like [`current_seq`](Self::current_seq), without a read conflict.
    pub fn current_seq_snapshot(&self, tx: &mut Transaction, subscriber: &[u8]) -> Result<u64> {
        let key = self.key(subscriber, COUNTER)?;
        Self::decode_counter(tx.snapshot_get(&key)?)
    }

    /// Increments the counter and returns the new value.
    ///
    /// # Errors
    ///
    /// `Error::SequenceOverflow` if the counter is already at `u64::MAX`.
    pub fn allocate_seq(&self, tx: &mut Transaction, subscriber: &[u8]) -> Result<u64> {
        let current = self.current_seq(tx, subscriber)?;
        let next = advance(current, 1)?;
        self.write_counter(tx, subscriber, next)?;
        Ok(next)
    }

    /// Reserves `count` consecutive values and returns the first.
    ///
    /// The reserved block is `old..old + count` and the counter becomes
    /// `old + count`.
    ///
    /// # Errors
    ///
    /// `Error::SequenceOverflow` if `old + count` exceeds `u64::MAX`.
    pub fn allocate_block(&self, tx: &mut Transaction, subscriber: &[u8], count: u64) -> Result<u64> {
        let old = self.current_seq(tx, subscriber)?;
        self.write_counter(tx, subscriber, advance(old, count)?)?;
        Ok(old)
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Raises the online-until timestamp to at least `expires_at`.
    ///
    /// Returns the previous timestamp, or `None` if the subscriber has never
    /// been online (or was marked offline). The stored value never decreases.
    pub fn refresh_online(
        &self,
        tx: &mut Transaction,
        subscriber: &[u8],
        expires_at: u64,
    ) -> Result<Option<u64>> {
        let key = self.key(subscriber, ONLINE_UNTIL)?;
        let previous = tx.get(&key)?.map(|bytes| le_u64(&bytes));
        tx.max(&key, expires_at);
        Ok(previous)
    }

    /// True iff an online-until timestamp exists and is `>= now`.
    pub fn is_online(&self, tx: &mut Transaction, subscriber: &[u8], now: u64) -> Result<bool> {
        let key = self.key(subscriber, ONLINE_UNTIL)?;
        Ok(tx
            .get(&key)?
            .is_some_and(|bytes| le_u64(&bytes) >= now))
    }

    /// Allocates only while the subscriber is online; otherwise `None` and the
    /// counter is untouched.
    pub fn allocate_seq_if_online(
        &self,
        tx: &mut Transaction,
        subscriber: &[u8],
        now: u64,
    ) -> Result<Option<u64>> {
        if !self.is_online(tx, subscriber, now)? {
            return Ok(None);
        }
        self.allocate_seq(tx, subscriber).map(Some)
    }

    /// Removes the online-until timestamp.
    pub fn mark_offline(&self, tx: &mut Transaction, subscriber: &[u8]) -> Result<()> {
        let key = self.key(subscriber, ONLINE_UNTIL)?;
        tx.clear(&key);
        Ok(())
    }
}

/// `current + count`, refusing to wrap.
fn advance(current: u64, count: u64) -> Result<u64> {
    current
        .checked_add(count)
        .ok_or(Error::SequenceOverflow {
            current,
            requested: count,
        })
}

/// A [`SequenceRepository`] whose allocations take a per-subscriber lock.
///
/// A second allocation for the same subscriber while the first still holds
/// the lock fails with [`Error::LockHeld`](crate::Error::LockHeld), and
/// concurrent transactions allocating for the same subscriber conflict on
/// the lock key as well as the counter.
#[derive(Debug, Clone)]
pub struct LockingSequenceRepository {
    inner: SequenceRepository,
    locks: LockSpace,
}

impl LockingSequenceRepository {
    /// Creates a locking repository; counters live under `space`, lock keys
    /// under a nested `("locks",)` subspace.
    pub fn new(space: Subspace) -> Result<Self> {
        let locks = LockSpace::new(space.subspace(&Tuple::new().push("locks"))?);
        Ok(Self {
            inner: SequenceRepository::new(space),
            locks,
        })
    }

    /// The unlocked repository, for reads and liveness.
    pub fn repository(&self) -> &SequenceRepository {
        &self.inner
    }

    fn lock_name(subscriber: &[u8]) -> String {
        let mut name = String::with_capacity(4 + subscriber.len() * 2);
        name.push_str("seq:");
        for byte in subscriber {
            let _ = write!(name, "{byte:02x}");
        }
        name
    }

    /// [`SequenceRepository::allocate_seq`] under the subscriber's lock.
    pub fn allocate_seq(&self, tx: &mut Transaction, subscriber: &[u8]) -> Result<u64> {
        self.locks
            .with_lock(tx, &Self::lock_name(subscriber), |tx| {
                self.inner.allocate_seq(tx, subscriber)
            })
    }

    /// [`SequenceRepository::allocate_block`] under the subscriber's lock.
    pub fn allocate_block(&self, tx: &mut Transaction, subscriber: &[u8], count: u64) -> Result<u64> {
        self.locks
            .with_lock(tx, &Self::lock_name(subscriber), |tx| {
                self.inner.allocate_block(tx, subscriber, count)
            })
    }

    /// Holds the subscriber's lock across `f`, for callers composing several
    /// allocations into one logical step.
    pub fn with_subscriber_lock<T, F>(&self, tx: &mut Transaction, subscriber: &[u8], f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction, &SequenceRepository) -> Result<T>,
    {
        self.locks
            .with_lock(tx, &Self::lock_name(subscriber), |tx| f(tx, &self.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::Store;

    fn repo() -> SequenceRepository {
        SequenceRepository::new(Subspace::new(&Tuple::new().push("seq")).unwrap())
    }

    #[test]
    fn test_allocate_counts_from_one() {
        let store = Store::open_in_memory().unwrap();
        let repo = repo();

        let mut tx = store.begin();
        assert_eq!(repo.current_seq(&mut tx, b"alice").unwrap(), 0);
        assert_eq!(repo.allocate_seq(&mut tx, b"alice").unwrap(), 1);
        assert_eq!(repo.allocate_seq(&mut tx, b"alice").unwrap(), 2);
        assert_eq!(repo.current_seq(&mut tx, b"bob").unwrap(), 0);
        tx.commit().unwrap();

        let mut tx = store.begin();
        assert_eq!(repo.current_seq_snapshot(&mut tx, b"alice").unwrap(), 2);
    }

    #[test]
    fn test_allocate_block() {
        let store = Store::open_in_memory().unwrap();
        let repo = repo();

        let mut tx = store.begin();
        repo.allocate_seq(&mut tx, b"s").unwrap();
        assert_eq!(repo.allocate_block(&mut tx, b"s", 10).unwrap(), 1);
        assert_eq!(repo.current_seq(&mut tx, b"s").unwrap(), 11);
        assert_eq!(repo.allocate_seq(&mut tx, b"s").unwrap(), 12);
    }

    #[test]
    fn test_allocation_past_u64_max_fails_without_wrapping() {
        let store = Store::open_in_memory().unwrap();
        let repo = repo();

        let mut tx = store.begin();
        assert_eq!(repo.allocate_seq(&mut tx, b"x").unwrap(), 1);
        assert!(matches!(
            repo.allocate_block(&mut tx, b"x", u64::MAX),
            Err(Error::SequenceOverflow { current: 1, requested: u64::MAX })
        ));
        assert_eq!(repo.current_seq(&mut tx, b"x").unwrap(), 1);

        // Exactly reaching the top is fine; one more is not.
        assert_eq!(repo.allocate_block(&mut tx, b"x", u64::MAX - 1).unwrap(), 1);
        assert!(matches!(
            repo.allocate_seq(&mut tx, b"x"),
            Err(Error::SequenceOverflow { current: u64::MAX, requested: 1 })
        ));
        tx.commit().unwrap();

        let mut tx = store.begin();
        assert_eq!(repo.current_seq(&mut tx, b"x").unwrap(), u64::MAX);
    }

    #[test]
    fn test_refresh_online_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let repo = repo();

        let first = store
            .transact(|tx| repo.refresh_online(tx, b"s", 1_000))
            .unwrap();
        assert_eq!(first, None);

        let second = store
            .transact(|tx| repo.refresh_online(tx, b"s", 500))
            .unwrap();
        assert_eq!(second, Some(1_000));

        let third = store
            .transact(|tx| repo.refresh_online(tx, b"s", 2_000))
            .unwrap();
        assert_eq!(third, Some(1_000));

        let mut tx = store.begin();
        assert!(repo.is_online(&mut tx, b"s", 2_000).unwrap());
        assert!(!repo.is_online(&mut tx, b"s", 2_001).unwrap());
    }

    #[test]
    fn test_allocate_if_online_gates_on_expiry() {
        let store = Store::open_in_memory().unwrap();
        let repo = repo();

        let before = store
            .transact(|tx| repo.allocate_seq_if_online(tx, b"s", 10))
            .unwrap();
        assert_eq!(before, None);

        store.transact(|tx| repo.refresh_online(tx, b"s", 100)).unwrap();
        let online = store
            .transact(|tx| repo.allocate_seq_if_online(tx, b"s", 100))
            .unwrap();
        assert_eq!(online, Some(1));

        let expired = store
            .transact(|tx| repo.allocate_seq_if_online(tx, b"s", 101))
            .unwrap();
        assert_eq!(expired, None);
        assert_eq!(store.transact(|tx| repo.current_seq(tx, b"s")).unwrap(), 1);
    }

    #[test]
    fn test_offline_during_transaction_conflicts() {
        let store = Store::open_in_memory().unwrap();
        let repo = repo();
        store.transact(|tx| repo.refresh_online(tx, b"s", 100)).unwrap();

        let mut tx = store.begin();
        assert_eq!(repo.allocate_seq_if_online(&mut tx, b"s", 50).unwrap(), Some(1));

        store.transact(|tx| repo.mark_offline(tx, b"s")).unwrap();
        assert!(matches!(tx.commit(), Err(Error::Conflict { .. })));
    }

    #[test]
    fn test_locking_repository_rejects_nested_allocation() {
        let store = Store::open_in_memory().unwrap();
        let repo =
            LockingSequenceRepository::new(Subspace::new(&Tuple::new().push("lseq")).unwrap())
                .unwrap();

        let mut tx = store.begin();
        assert_eq!(repo.allocate_seq(&mut tx, b"s").unwrap(), 1);
        assert_eq!(repo.allocate_block(&mut tx, b"s", 5).unwrap(), 1);

        let nested = repo.with_subscriber_lock(&mut tx, b"s", |tx, _| repo.allocate_seq(tx, b"s"));
        assert!(matches!(nested, Err(Error::LockHeld { .. })));

        let other = repo.with_subscriber_lock(&mut tx, b"s", |tx, inner| inner.allocate_seq(tx, b"t"));
        assert_eq!(other.unwrap(), 1);
    }
}
