//! # Event Feed Store
//!
//! Per-entity append-only event feeds with subscriber tracking.
//!
//! ## Key Layout
//!
//! ```text
//! feeds subspace
//! └── (feed.kind, feed.id, ...)
//!     ├── 0 settings
//!     │   ├── 0                 → (counter,)           cached read-through
//!     │   ├── 1                 → i64 little-endian    subscriber count, atomic add
//!     │   ├── 2, sub.kind, sub.id → ""                 explicit subscriber list
//!     │   └── 3                 → (true,)              jumbo flag, set once
//!     ├── 1, stamp              → (id, seq)            time index
//!     ├── 2, seq                → (id, stamp)          seq index
//!     └── 3, id                 → (seq, stamp)         id index
//!
//! subscriptions subspace
//! └── (sub.kind, sub.id, ...)
//!     ├── 0                     → i64 little-endian    stamp marker for get_state
//!     └── 1, feed.kind, feed.id → (stamp,)             subscription record
//! ```
//!
//! ## Systems Concept: Jumbo Feeds
//!
//! A feed keeps an explicit subscriber list so `post` can hand back its
//! fan-out targets. Past a threshold (50 subscribers by default) that list
//! becomes a liability, since every post would scan it. At that point the
//! feed turns **jumbo**: the list is deleted and never maintained again, and
//! posts report [`FanOut::Jumbo`] so the caller uses an external mechanism.
//!
//! ```text
//!   ┌───────────────────────┐  51st subscribe   ┌─────────────────────┐
//!   │ non-jumbo             │ ────────────────► │ jumbo (terminal)    │
//!   │ list = all subscribers│                   │ list deleted        │
//!   └───────────────────────┘                   └─────────────────────┘
//! ```
//!
//! ## Concurrency Notes
//!
//! - The subscriber count is only ever changed with atomic adds, so two
//!   unrelated subscribes never conflict on it. `subscribe` reads it as a
//!   snapshot read, except once the new count reaches the jumbo threshold:
//!   from there the read conflicts, so subscribes racing at the boundary
//!   serialize and the list never outgrows the threshold.
//! - `subscribe` records a read conflict on the jumbo flag. If another
//!   transaction flips the flag concurrently, this one retries instead of
//!   appending to a list that was just deleted.
//! - `post` read-modify-writes the feed counter. Concurrent posts to one feed
//!   conflict and retry, which keeps `seq` gap-free and increasing.
//! - All three index entries of a post are versionstamped by the same commit,
//!   so they always agree on the event's `date`.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::{debug, info};

use crate::cache::CachedSubspace;
use crate::codec::Tuple;
use crate::error::{Error, Result};
use crate::storage::{in_transaction, le_i64, RangeOptions, Store, Transaction, VersionstampHandle};
use crate::subspace::{key_after, Subspace};
use crate::types::{Eid, EventId, FanOut, FeedCursor, FeedEvent, Versionstamp};

// =============================================================================
// Configuration
// =============================================================================

/// Subscriber count above which a feed turns jumbo.
pub const DEFAULT_JUMBO_THRESHOLD: u64 = 50;

/// Configuration for a [`FeedStore`].
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// A subscribe that takes the count above this flips the feed to jumbo.
    pub jumbo_threshold: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            jumbo_threshold: DEFAULT_JUMBO_THRESHOLD,
        }
    }
}

// =============================================================================
// Key Discriminators
// =============================================================================

const SETTINGS: u64 = 0;
const TIME_INDEX: u64 = 1;
const SEQ_INDEX: u64 = 2;
const ID_INDEX: u64 = 3;

const COUNTER: u64 = 0;
const SUBSCRIBER_COUNT: u64 = 1;
const SUBSCRIBER_LIST: u64 = 2;
const JUMBO: u64 = 3;

const STAMP_MARKER: u64 = 0;
const SUBSCRIPTION: u64 = 1;

// =============================================================================
// Results
// =============================================================================

/// Snapshot of a feed's settings block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSettings {
    /// Number of events ever posted; the last assigned `seq`.
    pub counter: u64,
    /// Current number of subscribers.
    pub subscriber_count: u64,
    /// Whether the explicit subscriber list has been abandoned.
    pub jumbo: bool,
}

/// What [`FeedStore::post`] wrote.
///
/// The event's `date` is the commit stamp of the posting transaction, so it
/// is only known after that transaction commits. [`PostReceipt::event`]
/// returns `None` until then.
#[derive(Debug, Clone)]
pub struct PostReceipt {
    /// The new event's id
    pub id: EventId,
    /// The new event's sequence number
    pub seq: u64,
    /// Subscribers to notify
    pub fan_out: FanOut,
    user_version: u16,
    stamp: VersionstampHandle,
}

impl PostReceipt {
    /// The event's commit stamp, once committed.
    pub fn date(&self) -> Option<Versionstamp> {
        self.stamp.resolve(self.user_version)
    }

    /// The stored event, once committed.
    pub fn event(&self) -> Option<FeedEvent> {
        self.date().map(|date| FeedEvent {
            id: self.id,
            seq: self.seq,
            date,
        })
    }
}

/// Subscribe/unsubscribe calls made earlier in the same transaction.
///
/// Subscription records are versionstamped values, which a transaction can't
/// read back before commit.
#[derive(Default)]
struct PendingSubscriptions(HashMap<(Eid, Eid), bool>);

// =============================================================================
// Feed Store
// =============================================================================

/// The event feed store.
///
/// Stateless apart from its key layout; every operation takes the
/// transaction to run in, except [`FeedStore::get_state`] which needs a
/// commit of its own.
///
/// # Example
///
/// ```rust
/// use feedstore::{Eid, FeedStore, Store, Subspace, Tuple};
///
/// let store = Store::open_in_memory()?;
/// let feeds = FeedStore::new(&Subspace::new(&Tuple::new().push("app"))?)?;
/// let chat = Eid::new(1, 2);
/// let alice = Eid::new(0, 7);
///
/// store.transact(|tx| feeds.subscribe(tx, alice, chat))?;
/// let receipt = store.transact(|tx| feeds.post(tx, chat))?;
///
/// assert_eq!(receipt.seq, 1);
/// assert_eq!(receipt.fan_out.targets(), &[alice]);
/// assert!(receipt.event().is_some());
/// # Ok::<(), feedstore::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct FeedStore {
    feeds: Subspace,
    subscriptions: Subspace,
    counters: CachedSubspace,
    pending_scope: String,
    config: FeedConfig,
}

impl FeedStore {
    /// Creates a feed store under `root` with the default configuration.
    pub fn new(root: &Subspace) -> Result<Self> {
        Self::with_config(root, FeedConfig::default())
    }

    /// Creates a feed store under `root`.
    pub fn with_config(root: &Subspace, config: FeedConfig) -> Result<Self> {
        let feeds = root.subspace(&Tuple::new().push("feeds"))?;
        let subscriptions = root.subspace(&Tuple::new().push("subscriptions"))?;

        let mut pending_scope = String::from("feed-subscriptions:");
        for byte in root.prefix() {
            let _ = write!(pending_scope, "{byte:02x}");
        }

        Ok(Self {
            counters: CachedSubspace::new(feeds.clone()),
            feeds,
            subscriptions,
            pending_scope,
            config,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    // =========================================================================
    // Keys
    // =========================================================================

    fn feed_tuple(feed: Eid) -> Tuple {
        Tuple::new().push(feed.kind).push(feed.id)
    }

    fn counter_tuple(feed: Eid) -> Tuple {
        Self::feed_tuple(feed).push(SETTINGS).push(COUNTER)
    }

    fn count_key(&self, feed: Eid) -> Result<Vec<u8>> {
        self.feeds
            .pack(&Self::feed_tuple(feed).push(SETTINGS).push(SUBSCRIBER_COUNT))
    }

    fn jumbo_key(&self, feed: Eid) -> Result<Vec<u8>> {
        self.feeds
            .pack(&Self::feed_tuple(feed).push(SETTINGS).push(JUMBO))
    }

    fn list_space(&self, feed: Eid) -> Result<Subspace> {
        self.feeds
            .subspace(&Self::feed_tuple(feed).push(SETTINGS).push(SUBSCRIBER_LIST))
    }

    fn index_space(&self, feed: Eid, index: u64) -> Result<Subspace> {
        self.feeds.subspace(&Self::feed_tuple(feed).push(index))
    }

    fn subscription_key(&self, subscriber: Eid, feed: Eid) -> Result<Vec<u8>> {
        self.subscriptions.pack(
            &Self::feed_tuple(subscriber)
                .push(SUBSCRIPTION)
                .push(feed.kind)
                .push(feed.id),
        )
    }

    fn marker_key(&self, subscriber: Eid) -> Result<Vec<u8>> {
        self.subscriptions
            .pack(&Self::feed_tuple(subscriber).push(STAMP_MARKER))
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribes `subscriber` to `feed`, recording the commit stamp as the
    /// subscription's resume point.
    ///
    /// # Errors
    ///
    /// `Error::AlreadySubscribed` if the subscription exists.
    pub fn subscribe(&self, tx: &mut Transaction, subscriber: Eid, feed: Eid) -> Result<()> {
        if self.is_subscribed(tx, subscriber, feed)? {
            return Err(Error::AlreadySubscribed { subscriber, feed });
        }

        let user_version = tx.allocate_user_version()?;
        let (record, offset) = Tuple::new()
            .push(Versionstamp::incomplete(user_version))
            .pack_with_versionstamp(&[])?;
        tx.set_versionstamped_value(&self.subscription_key(subscriber, feed)?, record, offset)?;
        self.pending(tx).insert((subscriber, feed), true);

        let count_key = self.count_key(feed)?;
        let jumbo_key = self.jumbo_key(feed)?;
        let count = tx.snapshot_get(&count_key)?.map_or(0, |b| le_i64(&b));
        let jumbo = tx.snapshot_get(&jumbo_key)?.is_some();
        tx.add_read_conflict_key(&jumbo_key);
        tx.add(&count_key, 1);

        if jumbo {
            return Ok(());
        }

        let new_count = count + 1;
        let threshold = self.config.jumbo_threshold as i64;
        if new_count >= threshold {
            // Near the threshold the snapshot count decides list-vs-flip, so
            // concurrent subscribes here must serialize on it.
            tx.add_read_conflict_key(&count_key);
        }
        if new_count > threshold {
            tx.set(&jumbo_key, &Tuple::new().push(true).pack()?);
            let (begin, end) = self.list_space(feed)?.range();
            tx.clear_range(&begin, &end);
            info!(%feed, subscribers = new_count, "feed turned jumbo");
        } else {
            let entry = self
                .list_space(feed)?
                .pack(&Self::feed_tuple(subscriber))?;
            tx.set(&entry, &[]);
        }
        Ok(())
    }

    /// Removes a subscription. A jumbo feed stays jumbo.
    ///
    /// # Errors
    ///
    /// `Error::NotSubscribed` if there is no such subscription.
    pub fn unsubscribe(&self, tx: &mut Transaction, subscriber: Eid, feed: Eid) -> Result<()> {
        if !self.is_subscribed(tx, subscriber, feed)? {
            return Err(Error::NotSubscribed { subscriber, feed });
        }

        tx.clear(&self.subscription_key(subscriber, feed)?);
        self.pending(tx).insert((subscriber, feed), false);

        if !self.is_jumbo(tx, feed)? {
            let entry = self
                .list_space(feed)?
                .pack(&Self::feed_tuple(subscriber))?;
            tx.clear(&entry);
        }
        tx.add(&self.count_key(feed)?, -1);
        Ok(())
    }

    fn pending<'a>(&self, tx: &'a mut Transaction) -> &'a mut HashMap<(Eid, Eid), bool> {
        &mut tx.scoped::<PendingSubscriptions>(&self.pending_scope).0
    }

    /// Returns true if `subscriber` follows `feed`.
    pub fn is_subscribed(&self, tx: &mut Transaction, subscriber: Eid, feed: Eid) -> Result<bool> {
        if let Some(&pending) = self.pending(tx).get(&(subscriber, feed)) {
            return Ok(pending);
        }
        Ok(tx.get(&self.subscription_key(subscriber, feed)?)?.is_some())
    }

    /// The commit stamp recorded when `subscriber` subscribed to `feed`.
    ///
    /// `None` if not subscribed, or subscribed earlier in this same
    /// transaction (the stamp doesn't exist yet).
    pub fn subscription_stamp(
        &self,
        tx: &mut Transaction,
        subscriber: Eid,
        feed: Eid,
    ) -> Result<Option<FeedCursor>> {
        match tx.get(&self.subscription_key(subscriber, feed)?)? {
            Some(bytes) => Ok(Some(Tuple::unpack(&bytes)?.versionstamp(0)?)),
            None => Ok(None),
        }
    }

    /// Feeds `subscriber` follows, in key order.
    pub fn subscriptions(&self, tx: &mut Transaction, subscriber: Eid) -> Result<Vec<Eid>> {
        let space = self
            .subscriptions
            .subspace(&Self::feed_tuple(subscriber).push(SUBSCRIPTION))?;
        let (begin, end) = space.range();
        tx.get_range(&begin, &end, RangeOptions::new())?
            .iter()
            .map(|kv| decode_eid(&space.unpack(&kv.key)?, 0))
            .collect()
    }

    /// The explicit subscriber list, or `None` once the feed is jumbo.
    pub fn subscribers(&self, tx: &mut Transaction, feed: Eid) -> Result<Option<Vec<Eid>>> {
        if self.is_jumbo(tx, feed)? {
            return Ok(None);
        }
        self.list_subscribers(tx, feed).map(Some)
    }

    fn list_subscribers(&self, tx: &mut Transaction, feed: Eid) -> Result<Vec<Eid>> {
        let space = self.list_space(feed)?;
        let (begin, end) = space.range();
        tx.get_range(&begin, &end, RangeOptions::new())?
            .iter()
            .map(|kv| decode_eid(&space.unpack(&kv.key)?, 0))
            .collect()
    }

    fn is_jumbo(&self, tx: &mut Transaction, feed: Eid) -> Result<bool> {
        Ok(tx.get(&self.jumbo_key(feed)?)?.is_some())
    }

    /// Counter, subscriber count and jumbo flag of `feed`.
    pub fn settings(&self, tx: &mut Transaction, feed: Eid) -> Result<FeedSettings> {
        let counter = self.read_counter(tx, feed)?;
        let subscriber_count = tx
            .get(&self.count_key(feed)?)?
            .map_or(0, |b| le_i64(&b).max(0) as u64);
        let jumbo = self.is_jumbo(tx, feed)?;
        Ok(FeedSettings {
            counter,
            subscriber_count,
            jumbo,
        })
    }

    // =========================================================================
    // Posting
    // =========================================================================

    fn read_counter(&self, tx: &mut Transaction, feed: Eid) -> Result<u64> {
        match self.counters.read(tx, &Self::counter_tuple(feed))? {
            Some(value) => value.integer(0),
            None => Ok(0),
        }
    }

    /// Appends an event to `feed` and returns its fan-out targets.
    ///
    /// The three index entries share one commit stamp. The counter goes
    /// through the cached subspace, so several posts to one feed within a
    /// transaction read the store once.
    pub fn post(&self, tx: &mut Transaction, feed: Eid) -> Result<PostReceipt> {
        let seq = self.read_counter(tx, feed)? + 1;
        self.counters
            .write(tx, &Self::counter_tuple(feed), Some(&Tuple::new().push(seq)))?;

        let id = EventId::random();
        let user_version = tx.allocate_user_version()?;
        let stamp = Versionstamp::incomplete(user_version);

        let (time_key, offset) = self
            .index_space(feed, TIME_INDEX)?
            .pack_with_versionstamp(&Tuple::new().push(stamp))?;
        tx.set_versionstamped_key(time_key, offset, &Tuple::new().push(id).push(seq).pack()?)?;

        let seq_key = self.index_space(feed, SEQ_INDEX)?.pack(&Tuple::new().push(seq))?;
        let (value, offset) = Tuple::new().push(id).push(stamp).pack_with_versionstamp(&[])?;
        tx.set_versionstamped_value(&seq_key, value, offset)?;

        let id_key = self.index_space(feed, ID_INDEX)?.pack(&Tuple::new().push(id))?;
        let (value, offset) = Tuple::new().push(seq).push(stamp).pack_with_versionstamp(&[])?;
        tx.set_versionstamped_value(&id_key, value, offset)?;

        let fan_out = if self.is_jumbo(tx, feed)? {
            FanOut::Jumbo
        } else {
            FanOut::Direct(self.list_subscribers(tx, feed)?)
        };
        debug!(%feed, seq, %id, targets = fan_out.targets().len(), "posted event");

        Ok(PostReceipt {
            id,
            seq,
            fan_out,
            user_version,
            stamp: tx.versionstamp(),
        })
    }

    // =========================================================================
    // Reading Events
    // =========================================================================

    /// Looks up an event by id.
    pub fn get(&self, tx: &mut Transaction, feed: Eid, id: EventId) -> Result<Option<FeedEvent>> {
        let key = self.index_space(feed, ID_INDEX)?.pack(&Tuple::new().push(id))?;
        let Some(bytes) = tx.get(&key)? else {
            return Ok(None);
        };
        let value = Tuple::unpack(&bytes)?;
        Ok(Some(FeedEvent {
            id,
            seq: value.integer(0)?,
            date: value.versionstamp(1)?,
        }))
    }

    /// Looks up an event by sequence number.
    pub fn get_by_seq(&self, tx: &mut Transaction, feed: Eid, seq: u64) -> Result<Option<FeedEvent>> {
        let key = self.index_space(feed, SEQ_INDEX)?.pack(&Tuple::new().push(seq))?;
        let Some(bytes) = tx.get(&key)? else {
            return Ok(None);
        };
        let value = Tuple::unpack(&bytes)?;
        Ok(Some(FeedEvent {
            id: EventId::from_slice(value.bytes(0)?)?,
            seq,
            date: value.versionstamp(1)?,
        }))
    }

    /// Up to `limit` events committed strictly after the cursor `after`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// `Error::InvalidCursor` unless `after` is exactly 12 bytes, and
    /// `Error::IncompleteCursor` for an uncommitted placeholder stamp.
    pub fn fetch_after(
        &self,
        tx: &mut Transaction,
        feed: Eid,
        after: &[u8],
        limit: usize,
    ) -> Result<Vec<FeedEvent>> {
        let after = Versionstamp::from_bytes(after)?;
        if !after.is_complete() {
            return Err(Error::IncompleteCursor);
        }
        let space = self.index_space(feed, TIME_INDEX)?;
        let begin = key_after(&space.pack(&Tuple::new().push(after))?);
        let (_, end) = space.range();

        tx.get_range(&begin, &end, RangeOptions::new().with_limit(limit))?
            .iter()
            .map(|kv| decode_time_entry(&space, &kv.key, &kv.value))
            .collect()
    }

    /// The `limit` most recent events, oldest first.
    pub fn fetch_last(&self, tx: &mut Transaction, feed: Eid, limit: usize) -> Result<Vec<FeedEvent>> {
        let space = self.index_space(feed, TIME_INDEX)?;
        let (begin, end) = space.range();

        let mut events = tx
            .get_range(&begin, &end, RangeOptions::new().with_limit(limit).reversed())?
            .iter()
            .map(|kv| decode_time_entry(&space, &kv.key, &kv.value))
            .collect::<Result<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }

    // =========================================================================
    // Resume Cursors
    // =========================================================================

    /// Returns a cursor at the current end of commit order, for `subscriber`
    /// to resume from later.
    ///
    /// Runs its own transaction: a dummy atomic write to the subscriber's
    /// marker key gives it a commit stamp, and the allocated in-transaction
    /// index completes the cursor.
    ///
    /// # Errors
    ///
    /// `Error::NestedTransaction` if called from inside [`Store::transact`].
    pub fn get_state(&self, store: &Store, subscriber: Eid) -> Result<FeedCursor> {
        if in_transaction() {
            return Err(Error::NestedTransaction {
                operation: "get_state",
            });
        }

        let marker = self.marker_key(subscriber)?;
        let (handle, user_version) = store.transact(|tx| {
            tx.add(&marker, 1);
            let user_version = tx.allocate_user_version()?;
            Ok((tx.versionstamp(), user_version))
        })?;

        handle
            .resolve(user_version)
            .ok_or_else(|| Error::Internal("committed transaction has no versionstamp".to_string()))
    }
}

/// Decodes an `Eid` from two consecutive tuple elements.
fn decode_eid(tuple: &Tuple, at: usize) -> Result<Eid> {
    let kind = tuple.integer(at)?;
    let kind = u32::try_from(kind)
        .map_err(|_| Error::Decoding(format!("entity kind {kind} does not fit in 32 bits")))?;
    Ok(Eid::new(kind, tuple.integer(at + 1)?))
}

/// Decodes one time-index row.
fn decode_time_entry(space: &Subspace, key: &[u8], value: &[u8]) -> Result<FeedEvent> {
    let date = space.unpack(key)?.versionstamp(0)?;
    let value = Tuple::unpack(value)?;
    Ok(FeedEvent {
        id: EventId::from_slice(value.bytes(0)?)?,
        seq: value.integer(1)?,
        date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Store, FeedStore) {
        let store = Store::open_in_memory().unwrap();
        let feeds = FeedStore::new(&Subspace::new(&Tuple::new().push("test")).unwrap()).unwrap();
        (store, feeds)
    }

    const FEED: Eid = Eid::new(1, 2);

    #[test]
    fn test_double_subscribe_fails() {
        let (store, feeds) = setup();
        let alice = Eid::new(0, 1);

        store.transact(|tx| feeds.subscribe(tx, alice, FEED)).unwrap();
        let err = store
            .transact(|tx| feeds.subscribe(tx, alice, FEED))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadySubscribed { .. }));
    }

    #[test]
    fn test_unsubscribe_when_absent_fails() {
        let (store, feeds) = setup();
        let err = store
            .transact(|tx| feeds.unsubscribe(tx, Eid::new(0, 1), FEED))
            .unwrap_err();
        assert!(matches!(err, Error::NotSubscribed { .. }));
    }

    #[test]
    fn test_subscribe_then_unsubscribe_in_one_transaction() {
        let (store, feeds) = setup();
        let alice = Eid::new(0, 1);

        store
            .transact(|tx| {
                feeds.subscribe(tx, alice, FEED)?;
                assert!(feeds.is_subscribed(tx, alice, FEED)?);
                assert!(matches!(
                    feeds.subscribe(tx, alice, FEED),
                    Err(Error::AlreadySubscribed { .. })
                ));
                feeds.unsubscribe(tx, alice, FEED)
            })
            .unwrap();

        let mut tx = store.begin();
        assert!(!feeds.is_subscribed(&mut tx, alice, FEED).unwrap());
        assert_eq!(feeds.settings(&mut tx, FEED).unwrap().subscriber_count, 0);
        assert_eq!(feeds.subscribers(&mut tx, FEED).unwrap(), Some(vec![]));
    }

    #[test]
    fn test_subscription_stamp_orders_after_get_state() {
        let (store, feeds) = setup();
        let alice = Eid::new(0, 1);

        let before = feeds.get_state(&store, alice).unwrap();
        store.transact(|tx| feeds.subscribe(tx, alice, FEED)).unwrap();

        let mut tx = store.begin();
        let stamp = feeds.subscription_stamp(&mut tx, alice, FEED).unwrap().unwrap();
        assert!(stamp.is_complete());
        assert!(stamp > before);
        assert_eq!(feeds.subscriptions(&mut tx, alice).unwrap(), vec![FEED]);
    }

    #[test]
    fn test_post_reads_counter_once_per_transaction() {
        let (store, feeds) = setup();
        let receipts = store
            .transact(|tx| {
                let a = feeds.post(tx, FEED)?;
                let b = feeds.post(tx, FEED)?;
                Ok(vec![a, b])
            })
            .unwrap();

        assert_eq!(receipts[0].seq, 1);
        assert_eq!(receipts[1].seq, 2);

        let first = receipts[0].event().unwrap();
        let second = receipts[1].event().unwrap();
        assert_eq!(first.date.tx_version(), second.date.tx_version());
        assert!(first.date < second.date);

        let mut tx = store.begin();
        assert_eq!(feeds.settings(&mut tx, FEED).unwrap().counter, 2);
        assert_eq!(feeds.get(&mut tx, FEED, first.id).unwrap(), Some(first));
        assert_eq!(feeds.get_by_seq(&mut tx, FEED, 2).unwrap(), Some(second));
    }

    #[test]
    fn test_concurrent_posts_to_one_feed_conflict() {
        let (store, feeds) = setup();

        let mut a = store.begin();
        let mut b = store.begin();
        feeds.post(&mut a, FEED).unwrap();
        feeds.post(&mut b, FEED).unwrap();

        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(Error::Conflict { .. })));
    }

    #[test]
    fn test_fetch_after_rejects_bad_cursor() {
        let (store, feeds) = setup();
        let mut tx = store.begin();
        let err = feeds.fetch_after(&mut tx, FEED, &[0u8; 11], 10).unwrap_err();
        assert!(matches!(err, Error::InvalidCursor { len: 11 }));

        let placeholder = Versionstamp::incomplete(0).to_bytes();
        let err = feeds.fetch_after(&mut tx, FEED, &placeholder, 10).unwrap_err();
        assert!(matches!(err, Error::IncompleteCursor));
    }

    #[test]
    fn test_get_state_inside_transaction_fails() {
        let (store, feeds) = setup();
        let err = store
            .transact(|_tx| feeds.get_state(&store, Eid::new(0, 1)))
            .unwrap_err();
        assert!(matches!(err, Error::NestedTransaction { operation: "get_state" }));
    }

    #[test]
    fn test_get_state_is_monotonic() {
        let (store, feeds) = setup();
        let alice = Eid::new(0, 1);
        let a = feeds.get_state(&store, alice).unwrap();
        let b = feeds.get_state(&store, alice).unwrap();
        assert!(a.is_complete() && b.is_complete());
        assert!(a < b);
    }

    #[test]
    fn test_custom_jumbo_threshold() {
        let store = Store::open_in_memory().unwrap();
        let feeds = FeedStore::with_config(
            &Subspace::new(&Tuple::new().push("small")).unwrap(),
            FeedConfig { jumbo_threshold: 2 },
        )
        .unwrap();

        for id in 0..3 {
            store
                .transact(|tx| feeds.subscribe(tx, Eid::new(0, id), FEED))
                .unwrap();
        }

        let receipt = store.transact(|tx| feeds.post(tx, FEED)).unwrap();
        assert!(receipt.fan_out.is_jumbo());
        let mut tx = store.begin();
        assert_eq!(feeds.subscribers(&mut tx, FEED).unwrap(), None);
    }
}
