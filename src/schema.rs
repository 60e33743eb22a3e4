//! # SQLite Schema for the Key-Value Store
//!
//! The store keeps every committed write as its own row, tagged with the
//! version of the commit that produced it. That gives snapshot reads for free:
//! a transaction reading at version `V` sees, for each key, the newest row
//! with `version <= V`.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     kv_versions                             │
//! ├───────────────┬──────────┬──────────────────────────────────┤
//! │ key BLOB      │ version  │ value BLOB (NULL = tombstone)    │
//! ├───────────────┼──────────┼──────────────────────────────────┤
//! │ 02 61 00      │ 3        │ 15 01                            │
//! │ 02 61 00      │ 7        │ NULL        ← cleared at v7      │
//! │ 02 62 00      │ 5        │ 15 02                            │
//! └───────────────┴──────────┴──────────────────────────────────┘
//!
//! ┌─────────────────────────────┐
//! │ store_metadata              │
//! ├──────────────────┬──────────┤
//! │ schema_version   │ 1        │
//! │ last_version     │ 7        │
//! └──────────────────┴──────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why BLOB keys?
//!
//! SQLite compares BLOBs with `memcmp`, which is exactly byte-lexicographic
//! order. Range scans over tuple-packed keys therefore come back in tuple
//! order straight from the primary key index.
//!
//! ### Why is `last_version` stored separately?
//!
//! `MAX(version)` over the table would go backwards once garbage collection
//! removes trailing tombstones. Commit stamps must never repeat, so the high
//! water mark is persisted on its own and only ever increases.

use rusqlite::{params, Connection, OptionalExtension};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: opening a database with a different version is an
/// error.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Every committed write, one row per (key, commit version).
///
/// # Columns
///
/// - `key`: packed key bytes
/// - `version`: commit version that wrote this row
/// - `value`: value bytes, or NULL for a clear
///
/// `WITHOUT ROWID` makes `(key, version)` the clustered index, so "newest row
/// for this key at or below V" is a single index seek.
const CREATE_KV_VERSIONS: &str = r#"
CREATE TABLE IF NOT EXISTS kv_versions (
    key     BLOB    NOT NULL,
    version INTEGER NOT NULL,
    value   BLOB,
    PRIMARY KEY (key, version)
) WITHOUT ROWID
"#;

/// Key/value metadata: schema version and the committed version high-water mark.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS store_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the store schema applied.
///
/// # Rust Pattern: Newtype Wrapper
///
/// Wrapping `Connection` means a raw, uninitialized connection can never be
/// handed to the store by accident. [`Database::into_connection`] releases
/// the connection once initialization is done.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use feedstore::Database;
    ///
    /// let db = Database::open("feeds.db")?;
    /// # Ok::<(), feedstore::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// In-memory databases are lost when the connection closes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers of the file (backup tools, inspection) don't block commits.
        // In-memory databases silently keep their "memory" journal.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        // Sync the WAL on commit, not on every write.
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_KV_VERSIONS)?;

        self.verify_or_set_version()
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM store_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO store_metadata (key, value) VALUES ('schema_version', ?1)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Releases the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Version High-Water Mark
// =============================================================================

/// Reads the last committed version, `0` for a fresh database.
pub(crate) fn load_last_version(conn: &Connection) -> Result<u64> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM store_metadata WHERE key = 'last_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        None => Ok(0),
        Some(text) => text
            .parse()
            .map_err(|_| Error::Schema(format!("corrupt last_version '{text}'"))),
    }
}

/// Persists the last committed version. Must run inside the commit's SQLite transaction.
pub(crate) fn store_last_version(conn: &Connection, version: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO store_metadata (key, value) VALUES ('last_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
