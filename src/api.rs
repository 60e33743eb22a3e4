//! # Async API for feedstore
//!
//! This module provides the async handle most applications use. It wraps the
//! synchronous store with Tokio so that feed and sequence operations can be
//! awaited from async code without stalling the runtime.
//!
//! ## The SQLite Challenge
//!
//! Every store operation ends in SQLite calls, which block the calling
//! thread. Running them directly on a Tokio worker would stall every other
//! task scheduled on that worker.
//!
//! Our solution: **the blocking pool**
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Tokio Runtime                            │
//! │                                                             │
//! │  task1 ─┐                                                   │
//! │  task2 ─┼─ db.post(feed).await                              │
//! │  task3 ─┘        │                                          │
//! │                  ▼                                          │
//! │   spawn_blocking(move || store.transact(...))               │
//! └──────────────────┼──────────────────────────────────────────┘
//!                    ▼
//!        ┌───────────────────────┐
//!        │  Blocking pool thread │  ← retry loop + SQLite I/O
//!        │   Store (Arc, shared) │
//!        └───────────────────────┘
//! ```
//!
//! `Store` is `Clone + Send + Sync`, so every call just moves a clone into
//! the blocking closure. No channels or dedicated threads are needed.
//!
//! ## Rust Concepts
//!
//! - **spawn_blocking**: run sync code on a thread pool meant for blocking work
//! - **`'static` closures**: everything a blocking task uses is moved into it
//! - **JoinError**: a panicked blocking task surfaces as `Error::Internal`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::Tuple;
use crate::error::{Error, Result};
use crate::feed::{FeedConfig, FeedStore, PostReceipt};
use crate::schema::Database;
use crate::sequence::SequenceRepository;
use crate::storage::{Store, StoreConfig, Transaction};
use crate::subspace::Subspace;
use crate::types::{Eid, EventId, FeedCursor, FeedEvent};

// =============================================================================
// Configuration
// =============================================================================

/// Tuple prefix under which [`FeedDb`] keeps all of its data.
const ROOT_PREFIX: &str = "feedstore";

/// Configuration for a [`FeedDb`].
#[derive(Debug, Clone, Default)]
pub struct FeedDbConfig {
    /// Store retry and conflict-window settings
    pub store: StoreConfig,
    /// Feed settings
    pub feed: FeedConfig,
}

// =============================================================================
// FeedDb - The Main Async Handle
// =============================================================================

/// The main async handle for feed and sequence operations.
///
/// # Thread Safety
///
/// `FeedDb` is `Clone`, `Send`, and `Sync`. All clones share the same store.
///
/// # Example
///
/// ```rust,ignore
/// use feedstore::{Eid, FeedDb};
///
/// #[tokio::main]
/// async fn main() -> feedstore::Result<()> {
///     let db = FeedDb::open("feeds.db").await?;
///     let chat = Eid::new(1, 2);
///
///     db.subscribe(Eid::new(0, 7), chat).await?;
///     let receipt = db.post(chat).await?;
///     println!("posted seq {} to {:?}", receipt.seq, receipt.fan_out);
///
///     for event in db.fetch_last(chat, 10).await? {
///         println!("{} #{}", event.id, event.seq);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct FeedDb {
    store: Store,
    feeds: Arc<FeedStore>,
    sequences: Arc<SequenceRepository>,
}

impl FeedDb {
    /// Opens or creates a database file with the default configuration.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, FeedDbConfig::default()).await
    }

    /// Opens or creates a database file.
    pub async fn open_with_config<P: AsRef<Path>>(path: P, config: FeedDbConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = run_blocking(move || Database::open(path)).await?;
        Self::with_database(db, config)
    }

    /// Creates an in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_database(Database::open_in_memory()?, FeedDbConfig::default())
    }

    fn with_database(db: Database, config: FeedDbConfig) -> Result<Self> {
        let store = Store::with_config(db, config.store)?;
        Self::with_store(store, config.feed)
    }

    /// Wraps an existing store.
    pub fn with_store(store: Store, feed: FeedConfig) -> Result<Self> {
        let root = Subspace::new(&Tuple::new().push(ROOT_PREFIX))?;
        let feeds = FeedStore::with_config(&root, feed)?;
        let sequences = SequenceRepository::new(root.subspace(&Tuple::new().push("sequences"))?);

        Ok(Self {
            store,
            feeds: Arc::new(feeds),
            sequences: Arc::new(sequences),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The feed store, for use inside [`FeedDb::transact`].
    pub fn feeds(&self) -> &FeedStore {
        &self.feeds
    }

    /// The sequence repository, for use inside [`FeedDb::transact`].
    pub fn sequences(&self) -> &SequenceRepository {
        &self.sequences
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Runs `f` in a retried transaction on the blocking pool.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let feeds = db.feeds().clone();
    /// let (a, b) = db.transact(move |tx| {
    ///     Ok((feeds.post(tx, chat)?, feeds.post(tx, chat)?))
    /// }).await?;
    /// ```
    pub async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(&mut Transaction) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        run_blocking(move || store.transact(f)).await
    }

    // =========================================================================
    // Feeds
    // =========================================================================

    /// Subscribes `subscriber` to `feed`.
    pub async fn subscribe(&self, subscriber: Eid, feed: Eid) -> Result<()> {
        let feeds = Arc::clone(&self.feeds);
        self.transact(move |tx| feeds.subscribe(tx, subscriber, feed))
            .await
    }

    /// Unsubscribes `subscriber` from `feed`.
    pub async fn unsubscribe(&self, subscriber: Eid, feed: Eid) -> Result<()> {
        let feeds = Arc::clone(&self.feeds);
        self.transact(move |tx| feeds.unsubscribe(tx, subscriber, feed))
            .await
    }

    /// Posts an event. The receipt's `event()` is resolved.
    pub async fn post(&self, feed: Eid) -> Result<PostReceipt> {
        let feeds = Arc::clone(&self.feeds);
        self.transact(move |tx| feeds.post(tx, feed)).await
    }

    /// Looks up an event by id.
    pub async fn get(&self, feed: Eid, id: EventId) -> Result<Option<FeedEvent>> {
        let feeds = Arc::clone(&self.feeds);
        self.transact(move |tx| feeds.get(tx, feed, id)).await
    }

    /// Events committed after `after`, oldest first.
    pub async fn fetch_after(&self, feed: Eid, after: Vec<u8>, limit: usize) -> Result<Vec<FeedEvent>> {
        let feeds = Arc::clone(&self.feeds);
        self.transact(move |tx| feeds.fetch_after(tx, feed, &after, limit))
            .await
    }

    /// The `limit` most recent events, oldest first.
    pub async fn fetch_last(&self, feed: Eid, limit: usize) -> Result<Vec<FeedEvent>> {
        let feeds = Arc::clone(&self.feeds);
        self.transact(move |tx| feeds.fetch_last(tx, feed, limit))
            .await
    }

    /// A resume cursor for `subscriber`.
    pub async fn get_state(&self, subscriber: Eid) -> Result<FeedCursor> {
        let feeds = Arc::clone(&self.feeds);
        let store = self.store.clone();
        run_blocking(move || feeds.get_state(&store, subscriber)).await
    }

    // =========================================================================
    // Sequences
    // =========================================================================

    /// Allocates the next sequence number for `subscriber`.
    pub async fn allocate_seq(&self, subscriber: Vec<u8>) -> Result<u64> {
        let sequences = Arc::clone(&self.sequences);
        self.transact(move |tx| sequences.allocate_seq(tx, &subscriber))
            .await
    }

    /// Raises `subscriber`'s online-until timestamp; returns the previous one.
    pub async fn refresh_online(&self, subscriber: Vec<u8>, expires_at: u64) -> Result<Option<u64>> {
        let sequences = Arc::clone(&self.sequences);
        self.transact(move |tx| sequences.refresh_online(tx, &subscriber, expires_at))
            .await
    }

    /// Allocates only while `subscriber` is online at `now`.
    pub async fn allocate_seq_if_online(&self, subscriber: Vec<u8>, now: u64) -> Result<Option<u64>> {
        let sequences = Arc::clone(&self.sequences);
        self.transact(move |tx| sequences.allocate_seq_if_online(tx, &subscriber, now))
            .await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Removes row versions no reader can see.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let store = self.store.clone();
        run_blocking(move || store.collect_garbage()).await
    }

    /// Spawns a task that collects garbage every `interval`.
    ///
    /// Abort the returned handle to stop it.
    pub fn spawn_garbage_collector(&self, interval: Duration) -> JoinHandle<()> {
        let db = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match db.collect_garbage().await {
                    Ok(removed) => debug!(removed, "background garbage collection"),
                    Err(e) => warn!(error = %e, "background garbage collection failed"),
                }
            }
        })
    }
}

/// Runs blocking store work on Tokio's blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT: Eid = Eid::new(1, 2);

    #[tokio::test]
    async fn test_open_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let db = FeedDb::open(dir.path().join("feeds.db")).await.unwrap();
        assert_eq!(db.post(CHAT).await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_post_and_fetch() {
        let db = FeedDb::open_in_memory().unwrap();
        let alice = Eid::new(0, 1);
        db.subscribe(alice, CHAT).await.unwrap();

        let receipt = db.post(CHAT).await.unwrap();
        assert_eq!(receipt.fan_out.targets(), &[alice]);
        let event = receipt.event().expect("resolved after commit");

        assert_eq!(db.get(CHAT, event.id).await.unwrap(), Some(event));
        assert_eq!(db.fetch_last(CHAT, 5).await.unwrap(), vec![event]);
    }

    #[tokio::test]
    async fn test_get_state_then_fetch_after() {
        let db = FeedDb::open_in_memory().unwrap();
        db.post(CHAT).await.unwrap();
        let cursor = db.get_state(Eid::new(0, 1)).await.unwrap();
        let later = db.post(CHAT).await.unwrap();

        let events = db
            .fetch_after(CHAT, cursor.to_bytes().to_vec(), 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, later.seq);
    }

    #[tokio::test]
    async fn test_sequences_over_async_handle() {
        let db = FeedDb::open_in_memory().unwrap();
        assert_eq!(db.allocate_seq_if_online(b"s".to_vec(), 5).await.unwrap(), None);
        assert_eq!(db.refresh_online(b"s".to_vec(), 10).await.unwrap(), None);
        assert_eq!(db.allocate_seq_if_online(b"s".to_vec(), 5).await.unwrap(), Some(1));
        assert_eq!(db.allocate_seq(b"s".to_vec()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_posts_get_distinct_seqs() {
        let db = FeedDb::open_in_memory().unwrap();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                tokio::spawn(async move { db.post(CHAT).await })
            })
            .collect();

        let mut seqs = Vec::new();
        for task in tasks {
            seqs.push(task.await.unwrap().unwrap().seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=8).collect::<Vec<_>>());
    }
}
