//! Record of export units already converted, so repeated runs only pick up
//! new bundles.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("cannot create ledger directory {path}: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Key/value store of processed unit keys (`"<provider>/<label>"`).
pub trait Ledger {
    fn is_processed(&self, key: &str) -> Result<bool, LedgerError>;
    fn mark_processed(&mut self, key: &str) -> Result<(), LedgerError>;
}

/// Ledger backed by a SQLite file.
pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Dir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS processed (
                key TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    /// When `key` was last marked, as an RFC 3339 timestamp.
    pub fn processed_at(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let at = self
            .conn
            .query_row(
                "SELECT processed_at FROM processed WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(at)
    }
}

impl Ledger for SqliteLedger {
    fn is_processed(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.processed_at(key)?.is_some())
    }

    fn mark_processed(&mut self, key: &str) -> Result<(), LedgerError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO processed (key, processed_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET processed_at = excluded.processed_at",
            params![key, now],
        )?;
        Ok(())
    }
}

/// Process-local ledger, forgotten on exit.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    keys: HashSet<String>,
}

impl Ledger for MemoryLedger {
    fn is_processed(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.keys.contains(key))
    }

    fn mark_processed(&mut self, key: &str) -> Result<(), LedgerError> {
        self.keys.insert(key.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_ledger_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.sqlite");

        let mut ledger = SqliteLedger::open(&path).unwrap();
        assert!(!ledger.is_processed("claude/2025-01").unwrap());
        ledger.mark_processed("claude/2025-01").unwrap();
        ledger.mark_processed("claude/2025-01").unwrap();
        drop(ledger);

        let ledger = SqliteLedger::open(&path).unwrap();
        assert!(ledger.is_processed("claude/2025-01").unwrap());
        assert!(!ledger.is_processed("chatgpt/2025-01").unwrap());
        assert!(ledger.processed_at("claude/2025-01").unwrap().is_some());
    }

    fn mark_and_query(ledger: &mut dyn Ledger) {
        ledger.mark_processed("gemini/a").unwrap();
        assert!(ledger.is_processed("gemini/a").unwrap());
        assert!(!ledger.is_processed("gemini/b").unwrap());
    }

    #[test]
    fn memory_ledger() {
        mark_and_query(&mut MemoryLedger::default());
    }

    #[test]
    fn in_memory_sqlite_ledger() {
        let mut ledger = SqliteLedger::in_memory().unwrap();
        mark_and_query(&mut ledger);
        assert!(ledger.processed_at("gemini/a").unwrap().is_some());
        assert!(ledger.processed_at("gemini/b").unwrap().is_none());
    }
}
