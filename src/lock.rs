//! # In-Transaction Advisory Locks
//!
//! A named lock scoped to one transaction. Acquiring it does two things:
//!
//! 1. **Within the transaction**: the name is recorded as held, and a second
//!    acquire of the same name fails with [`Error::LockHeld`] instead of
//!    letting two logical call sites interleave on one resource.
//! 2. **Across transactions**: the lock key is read (conflicting) and written.
//!    Two transactions that take the same lock concurrently can't both
//!    commit; the later one gets a retryable conflict.
//!
//! ```text
//!   lock key = subspace ++ pack(xxh3_64(name))
//!
//!   tx A: acquire("seq:alice") ── get(key), add(key, 1) ──► commit v8 ✓
//!   tx B: acquire("seq:alice") ── get(key), add(key, 1) ──► commit ✗ Conflict
//! ```
//!
//! Nothing is held outside the transaction: dropping or committing it
//! releases every lock. The store never blocks on a lock.

use std::collections::HashSet;

use xxhash_rust::xxh3::xxh3_64;

use crate::codec::Tuple;
use crate::error::{Error, Result};
use crate::storage::Transaction;
use crate::subspace::Subspace;

/// Scoped-storage slot for the names held by one transaction.
const HELD_SCOPE: &str = "advisory-locks";

/// Names held by the current transaction, per lock space prefix.
#[derive(Default)]
struct HeldLocks(HashSet<(Vec<u8>, String)>);

/// A family of named locks stored under one subspace.
#[derive(Debug, Clone)]
pub struct LockSpace {
    space: Subspace,
}

impl LockSpace {
    /// Creates a lock space.
    pub fn new(space: Subspace) -> Self {
        Self { space }
    }

    /// The key backing lock `name`.
    ///
    /// Names are hashed to a fixed-width integer so arbitrarily long names
    /// produce short keys.
    pub fn key(&self, name: &str) -> Result<Vec<u8>> {
        self.space.pack(&Tuple::new().push(xxh3_64(name.as_bytes())))
    }

    /// Acquires `name` for the rest of the transaction.
    ///
    /// # Errors
    ///
    /// `Error::LockHeld` if this transaction already holds `name`.
    pub fn acquire(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        let slot = (self.space.prefix().to_vec(), name.to_owned());
        let held = tx.scoped::<HeldLocks>(HELD_SCOPE);
        if held.0.contains(&slot) {
            return Err(Error::LockHeld {
                name: name.to_owned(),
            });
        }
        held.0.insert(slot);

        let key = self.key(name)?;
        tx.get(&key)?;
        tx.add(&key, 1);
        Ok(())
    }

    /// Releases `name` within the transaction.
    ///
    /// The conflict footprint stays: the transaction still read and wrote the
    /// lock key.
    pub fn release(&self, tx: &mut Transaction, name: &str) {
        let slot = (self.space.prefix().to_vec(), name.to_owned());
        tx.scoped::<HeldLocks>(HELD_SCOPE).0.remove(&slot);
    }

    /// Returns true if this transaction currently holds `name`.
    pub fn is_held(&self, tx: &mut Transaction, name: &str) -> bool {
        let slot = (self.space.prefix().to_vec(), name.to_owned());
        tx.scoped::<HeldLocks>(HELD_SCOPE).0.contains(&slot)
    }

    /// Runs `f` while holding `name`, releasing it afterwards even if `f` fails.
    pub fn with_lock<T, F>(&self, tx: &mut Transaction, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        self.acquire(tx, name)?;
        let result = f(tx);
        self.release(tx, name);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;

    fn locks() -> LockSpace {
        LockSpace::new(Subspace::new(&Tuple::new().push("locks")).unwrap())
    }

    #[test]
    fn test_reacquire_in_same_transaction_fails() {
        let store = Store::open_in_memory().unwrap();
        let locks = locks();
        let mut tx = store.begin();

        locks.acquire(&mut tx, "a").unwrap();
        assert!(matches!(
            locks.acquire(&mut tx, "a"),
            Err(Error::LockHeld { name }) if name == "a"
        ));
        locks.acquire(&mut tx, "b").unwrap();

        locks.release(&mut tx, "a");
        locks.acquire(&mut tx, "a").unwrap();
    }

    #[test]
    fn test_with_lock_releases_on_error() {
        let store = Store::open_in_memory().unwrap();
        let locks = locks();
        let mut tx = store.begin();

        let result: Result<()> =
            locks.with_lock(&mut tx, "job", |_| Err(Error::Internal("boom".into())));
        assert!(result.is_err());
        assert!(!locks.is_held(&mut tx, "job"));
    }

    #[test]
    fn test_concurrent_holders_conflict() {
        let store = Store::open_in_memory().unwrap();
        let locks = locks();

        let mut a = store.begin();
        let mut b = store.begin();
        locks.acquire(&mut a, "shared").unwrap();
        locks.acquire(&mut b, "shared").unwrap();

        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(Error::Conflict { .. })));
    }

    #[test]
    fn test_different_names_do_not_conflict() {
        let store = Store::open_in_memory().unwrap();
        let locks = locks();

        let mut a = store.begin();
        let mut b = store.begin();
        locks.acquire(&mut a, "x").unwrap();
        locks.acquire(&mut b, "y").unwrap();

        a.commit().unwrap();
        b.commit().unwrap();
    }

    #[test]
    fn test_key_is_fixed_width() {
        let locks = locks();
        let short = locks.key("a").unwrap();
        let long = locks.key(&"n".repeat(500)).unwrap();
        assert!(long.len() <= short.len() + 8);
    }
}
