#![allow(dead_code)]

use std::path::PathBuf;

use feedstore::{Database, FeedStore, Store, StoreConfig, Subspace, Tuple};

pub fn memory_store() -> Store {
    Store::open_in_memory().expect("open in-memory store")
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_file_store(path: &PathBuf) -> Store {
    let db = Database::open(path).expect("open database");
    Store::with_config(db, StoreConfig::default()).expect("open store")
}

pub fn app_space() -> Subspace {
    Subspace::new(&Tuple::new().push("app")).expect("app subspace")
}

pub fn feed_store() -> FeedStore {
    FeedStore::new(&app_space()).expect("feed store")
}

/// In-memory store with a custom retry budget.
pub fn store_with_retries(max_retries: usize) -> Store {
    let config = StoreConfig {
        max_retries,
        ..StoreConfig::default()
    };
    Store::with_config(Database::open_in_memory().expect("open database"), config)
        .expect("open store")
}

/// Store with no retries, for tests that want to see conflicts surface.
pub fn store_without_retries() -> Store {
    store_with_retries(0)
}
