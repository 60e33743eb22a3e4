//! # Cached Read-Through Subspace
//!
//! A small per-transaction cache in front of one subspace. Components that
//! read the same record several times in one transaction (a feed counter read
//! by `post`, then again by a second `post` to the same feed) go to the store
//! once and hit memory afterwards.
//!
//! ## Lifecycle
//!
//! ```text
//!   read(k) ── cache hit? ──yes──► cached value (present or known-absent)
//!              │no
//!              ▼
//!         tx.get(k) ──► remember result ──► return
//!
//!   write(k, v) ──► cache[k] = v
//!                   pending[k] = encode(v)
//!                   first write? ──► register ONE before-commit flush
//!
//!   commit() ──► flush: pending → tx.set / tx.clear ──► pending = {}
//! ```
//!
//! ## Systems Concept: Transaction-Scoped State
//!
//! The cache lives in [`Transaction::scoped`], so it is created with the
//! transaction and dropped with it. A retried attempt starts with a fresh,
//! empty cache, and two concurrent transactions can never observe each
//! other's cached values. There is no process-global registry.
//!
//! ## Visibility
//!
//! Staged writes are visible through [`CachedSubspace::read`] immediately,
//! but only reach the transaction's own write buffer when the flush hook
//! runs. Code that mixes cached and raw access to the same keys must go
//! through the cache for both.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use tracing::debug;

use crate::codec::Tuple;
use crate::error::Result;
use crate::storage::Transaction;
use crate::subspace::Subspace;

/// Cache contents for one subspace within one transaction.
#[derive(Default)]
struct CacheState {
    /// Decoded values by packed key. `None` = known absent.
    values: HashMap<Vec<u8>, Option<Tuple>>,
    /// Writes not yet handed to the transaction, by packed key.
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Whether a flush hook is registered for the current pending batch.
    flush_registered: bool,
}

/// A read-through, write-back cache over one subspace.
///
/// `CachedSubspace` itself is stateless and cheap to clone; the cached data
/// lives in the transaction passed to each call.
///
/// # Example
///
/// ```rust
/// use feedstore::{CachedSubspace, Store, Subspace, Tuple};
///
/// let store = Store::open_in_memory()?;
/// let cache = CachedSubspace::new(Subspace::new(&Tuple::new().push("settings"))?);
///
/// store.transact(|tx| {
///     let key = Tuple::new().push("theme");
///     cache.write(tx, &key, Some(&Tuple::new().push("dark")))?;
///     assert_eq!(cache.read(tx, &key)?, Some(Tuple::new().push("dark")));
///     Ok(())
/// })?;
/// # Ok::<(), feedstore::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct CachedSubspace {
    space: Subspace,
    scope: String,
}

impl CachedSubspace {
    /// Wraps a subspace.
    pub fn new(space: Subspace) -> Self {
        let mut scope = String::from("cached-subspace:");
        for byte in space.prefix() {
            let _ = write!(scope, "{byte:02x}");
        }
        Self { space, scope }
    }

    /// The underlying subspace.
    pub fn subspace(&self) -> &Subspace {
        &self.space
    }

    /// Reads the tuple stored under `key`, through the cache.
    ///
    /// A miss reads the store with a conflicting read and caches the result,
    /// including absence.
    pub fn read(&self, tx: &mut Transaction, key: &Tuple) -> Result<Option<Tuple>> {
        let packed = self.space.pack(key)?;
        if let Some(cached) = tx.scoped::<CacheState>(&self.scope).values.get(&packed) {
            return Ok(cached.clone());
        }

        let value = match tx.get(&packed)? {
            Some(bytes) => Some(Tuple::unpack(&bytes)?),
            None => None,
        };
        tx.scoped::<CacheState>(&self.scope)
            .values
            .insert(packed, value.clone());
        Ok(value)
    }

    /// Stages `key = value` (or a clear when `value` is `None`).
    ///
    /// The cache reflects the write at once. The store sees it when the
    /// flush hook runs at commit.
    pub fn write(&self, tx: &mut Transaction, key: &Tuple, value: Option<&Tuple>) -> Result<()> {
        let packed = self.space.pack(key)?;
        let encoded = value.map(Tuple::pack).transpose()?;

        let state = tx.scoped::<CacheState>(&self.scope);
        state.values.insert(packed.clone(), value.cloned());
        state.pending.insert(packed, encoded);
        if state.flush_registered {
            return Ok(());
        }
        state.flush_registered = true;

        let scope = self.scope.clone();
        tx.before_commit(move |tx| flush(tx, &scope));
        Ok(())
    }
}

/// Hands every staged write to the transaction and resets the batch.
fn flush(tx: &mut Transaction, scope: &str) -> Result<()> {
    let state = tx.scoped::<CacheState>(scope);
    let pending = std::mem::take(&mut state.pending);
    state.flush_registered = false;

    debug!(scope, writes = pending.len(), "flushing cached subspace");
    for (key, value) in pending {
        match value {
            Some(bytes) => tx.set(&key, &bytes),
            None => tx.clear(&key),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;

    fn cache() -> CachedSubspace {
        CachedSubspace::new(Subspace::new(&Tuple::new().push("cache")).unwrap())
    }

    #[test]
    fn test_miss_caches_absence() {
        let store = Store::open_in_memory().unwrap();
        let cache = cache();
        let key = Tuple::new().push(1u64);

        let mut tx = store.begin();
        assert_eq!(cache.read(&mut tx, &key).unwrap(), None);

        // Written behind the cache's back: the cached absence wins.
        let packed = cache.subspace().pack(&key).unwrap();
        tx.set(&packed, &Tuple::new().push(9u64).pack().unwrap());
        assert_eq!(cache.read(&mut tx, &key).unwrap(), None);
    }

    #[test]
    fn test_writes_flush_at_commit() {
        let store = Store::open_in_memory().unwrap();
        let cache = cache();
        let key = Tuple::new().push("k");
        let packed = cache.subspace().pack(&key).unwrap();

        let mut tx = store.begin();
        cache.write(&mut tx, &key, Some(&Tuple::new().push(5u64))).unwrap();
        // Not in the raw write buffer until the hook runs.
        assert_eq!(tx.get(&packed).unwrap(), None);
        tx.commit().unwrap();

        let stored = store.begin().get(&packed).unwrap().unwrap();
        assert_eq!(Tuple::unpack(&stored).unwrap(), Tuple::new().push(5u64));
    }

    #[test]
    fn test_write_none_clears() {
        let store = Store::open_in_memory().unwrap();
        let cache = cache();
        let key = Tuple::new().push("k");

        store
            .transact(|tx| cache.write(tx, &key, Some(&Tuple::new().push(true))))
            .unwrap();
        store
            .transact(|tx| {
                assert!(cache.read(tx, &key)?.is_some());
                cache.write(tx, &key, None)?;
                assert_eq!(cache.read(tx, &key)?, None);
                Ok(())
            })
            .unwrap();

        let mut tx = store.begin();
        assert_eq!(cache.read(&mut tx, &key).unwrap(), None);
    }

    #[test]
    fn test_many_writes_register_one_hook() {
        let store = Store::open_in_memory().unwrap();
        let cache = cache();

        let mut tx = store.begin();
        for i in 0..10u64 {
            cache
                .write(&mut tx, &Tuple::new().push(i), Some(&Tuple::new().push(i)))
                .unwrap();
        }
        assert_eq!(tx.scoped::<CacheState>(&cache.scope).pending.len(), 10);
        assert!(tx.scoped::<CacheState>(&cache.scope).flush_registered);
        tx.commit().unwrap();

        let mut check = store.begin();
        for i in 0..10u64 {
            assert_eq!(
                cache.read(&mut check, &Tuple::new().push(i)).unwrap(),
                Some(Tuple::new().push(i))
            );
        }
    }

    #[test]
    fn test_separate_subspaces_do_not_share_cache() {
        let store = Store::open_in_memory().unwrap();
        let a = CachedSubspace::new(Subspace::new(&Tuple::new().push("a")).unwrap());
        let b = CachedSubspace::new(Subspace::new(&Tuple::new().push("b")).unwrap());
        let key = Tuple::new().push(1u64);

        let mut tx = store.begin();
        a.write(&mut tx, &key, Some(&Tuple::new().push("in a"))).unwrap();
        assert_eq!(b.read(&mut tx, &key).unwrap(), None);
    }
}
