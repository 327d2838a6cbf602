//! SQLite-backed table storage.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::{random_key, Storage, StorageError, StorageResult, StorageTable};

/// Table storage over a single SQLite database.
///
/// Each logical table becomes one SQL table with a `key` primary key, a
/// `value` blob, and a nullable `expires_at` timestamp. Row order follows
/// `rowid`, so enumeration preserves insertion order.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Ok(Self::with_connection(Connection::open(path)?))
    }

    /// Opens an in-memory database, used by tests and ephemeral setups.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self::with_connection(Connection::open_in_memory()?))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

impl Storage for SqliteStorage {
    fn table(&self, name: &str) -> StorageResult<Arc<dyn StorageTable>> {
        validate_table_name(name)?;
        let conn = lock(&self.conn)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                     key TEXT PRIMARY KEY,
                     value BLOB NOT NULL,
                     expires_at INTEGER
                 )"
            ),
            [],
        )?;
        drop(conn);
        Ok(Arc::new(SqliteTable {
            conn: Arc::clone(&self.conn),
            name: name.to_string(),
        }))
    }
}

struct SqliteTable {
    conn: Arc<Mutex<Connection>>,
    name: String,
}

impl StorageTable for SqliteTable {
    fn insert(
        &self,
        key: Option<&str>,
        value: &[u8],
        expires_at: Option<u64>,
    ) -> StorageResult<String> {
        let key = key.map_or_else(random_key, str::to_string);
        let conn = lock(&self.conn)?;
        let result = conn.execute(
            &format!("INSERT INTO {} (key, value, expires_at) VALUES (?1, ?2, ?3)", self.name),
            params![key, value, expires_at],
        );
        match result {
            Ok(_) => Ok(key),
            Err(err) if is_constraint_violation(&err) => Err(StorageError::DuplicateKey(key)),
            Err(err) => Err(err.into()),
        }
    }

    fn get(&self, key: &str, now: u64) -> StorageResult<Option<Vec<u8>>> {
        let conn = lock(&self.conn)?;
        let value = conn
            .query_row(
                &format!(
                    "SELECT value FROM {} WHERE key = ?1
                     AND (expires_at IS NULL OR expires_at > ?2)",
                    self.name
                ),
                params![key, now],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn update(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            &format!("UPDATE {} SET value = ?2 WHERE key = ?1", self.name),
            params![key, value],
        )?;
        if changed == 0 {
            return Err(StorageError::KeyNotFound(key.to_string()));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            &format!("DELETE FROM {} WHERE key = ?1", self.name),
            params![key],
        )?;
        Ok(changed > 0)
    }

    fn enumerate(&self, now: u64) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let conn = lock(&self.conn)?;
        let mut statement = conn.prepare(&format!(
            "SELECT key, value FROM {}
             WHERE expires_at IS NULL OR expires_at > ?1
             ORDER BY rowid",
            self.name
        ))?;
        let rows = statement
            .query_map(params![now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn purge_expired(&self, now: u64) -> StorageResult<usize> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                self.name
            ),
            params![now],
        )?;
        Ok(removed)
    }
}

fn lock(conn: &Arc<Mutex<Connection>>) -> StorageResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| StorageError::Poisoned)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_table_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && !name.chars().next().is_some_and(|c| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidTableName(name.to_string()))
    }
}
