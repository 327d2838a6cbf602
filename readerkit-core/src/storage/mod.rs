//! Keyed table storage for client and server state.
//!
//! A [`Storage`] is a set of named tables. Each table maps string keys to
//! opaque byte values with an optional expiration timestamp; every read takes
//! the caller's `now` so expired rows are never observable. The client and
//! the server each own an independent instance.

mod sqlite;

pub use sqlite::SqliteStorage;

use std::sync::Arc;

use thiserror::Error;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database_error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("invalid table name: {0}")]
    InvalidTableName(String),
    #[error("key already exists: {0}")]
    DuplicateKey(String),
    #[error("no such key: {0}")]
    KeyNotFound(String),
    #[error("storage lock poisoned")]
    Poisoned,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A set of named key/value tables.
pub trait Storage: Send + Sync {
    /// Opens the table named `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not a plain identifier or the table
    /// cannot be created.
    fn table(&self, name: &str) -> StorageResult<Arc<dyn StorageTable>>;
}

/// A single keyed table.
///
/// Keys are strings; values are opaque bytes. Rows may carry an `expires_at`
/// unix timestamp, after which they are invisible to `get` and `enumerate`
/// and eligible for [`StorageTable::purge_expired`].
pub trait StorageTable: Send + Sync {
    /// Inserts `value` under `key`, or under a fresh random key when `key` is
    /// `None`. Returns the key the row was stored under.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateKey`] if an explicit key is already
    /// present.
    fn insert(
        &self,
        key: Option<&str>,
        value: &[u8],
        expires_at: Option<u64>,
    ) -> StorageResult<String>;

    /// Reads the value under `key`, treating rows expired at `now` as absent.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    fn get(&self, key: &str, now: u64) -> StorageResult<Option<Vec<u8>>>;

    /// Replaces the value under an existing `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyNotFound`] if the key is absent.
    fn update(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Deletes the row under `key`. Returns whether a row existed; deleting
    /// an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Lists all non-expired rows in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    fn enumerate(&self, now: u64) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Removes rows expired at `now`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    fn purge_expired(&self, now: u64) -> StorageResult<usize>;
}

/// Produces a fresh random row key (16 bytes, hex).
///
/// # Panics
///
/// Panics if the system's random number generator fails.
#[must_use]
pub fn random_key() -> String {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    hex::encode(bytes)
}
