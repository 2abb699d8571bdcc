//! SQLite storage for the token ledger
//!
//! Every unit of work opens its own connection to the database file, so
//! request handlers on different threads never share a connection. Writes
//! run in `BEGIN IMMEDIATE` transactions: the first statement takes the
//! database write lock, which serializes every mutation of a phase record
//! or balance row. Waiting for that lock is bounded by the configured
//! lock timeout.
//!
//! ## Tables
//!
//! - `balances` - cached spendable balance per user
//! - `transactions` - append-only balance history (replay source)
//! - `phase_records` - per-submission phase flags and bonuses
//! - `phase_events` - append-only phase completion audit trail
//! - `achievement_unlocks` - one row per (user, achievement)

pub mod achievement_unlocks;
pub mod balances;
pub mod models;
pub mod phase_records;
pub mod schema;
pub mod transactions;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::LedgerError;

/// File name of the ledger database inside the storage directory
pub const DEFAULT_DB_FILE: &str = "ledger.db";

/// Map a rusqlite error onto the ledger taxonomy.
///
/// Busy/locked means the write lock was not acquired within the timeout.
pub(crate) fn map_sqlite_error(context: &str, e: rusqlite::Error) -> LedgerError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            LedgerError::ConcurrencyTimeout(format!("{}: {}", context, e))
        }
        _ => LedgerError::Persistence(format!("{} failed: {}", context, e)),
    }
}

/// Handle to the ledger database
pub struct LedgerDb {
    db_path: PathBuf,
    lock_timeout: Duration,
}

impl LedgerDb {
    /// Open or create the ledger database in a storage directory
    pub fn open(storage_dir: &Path, lock_timeout: Duration) -> Result<Self, LedgerError> {
        Self::open_at(storage_dir.join(DEFAULT_DB_FILE), lock_timeout)
    }

    /// Open or create the ledger database at an explicit file path
    pub fn open_at(db_path: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, LedgerError> {
        let db_path = db_path.into();
        info!("Opening ledger database at {:?}", db_path);

        let db = Self { db_path, lock_timeout };

        let mut conn = db.connect()?;
        // WAL lets plain reads proceed while a writer holds the lock
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| map_sqlite_error("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| map_sqlite_error("set synchronous", e))?;

        schema::init_schema(&mut conn)?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn connect(&self) -> Result<Connection, LedgerError> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| map_sqlite_error("open ledger database", e))?;
        conn.busy_timeout(self.lock_timeout)
            .map_err(|e| map_sqlite_error("set busy_timeout", e))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| map_sqlite_error("enable foreign keys", e))?;
        Ok(conn)
    }

    /// Run a read-only operation. Takes no write lock.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    /// Run a write operation as one all-or-nothing unit.
    ///
    /// The closure runs with the database write lock held. Returning `Err`
    /// drops the transaction, which rolls back every statement it issued.
    pub fn with_write_tx<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, LedgerError>,
    {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_sqlite_error("acquire write lock", e))?;

        let value = f(&tx)?;

        tx.commit().map_err(|e| map_sqlite_error("commit", e))?;
        Ok(value)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, LedgerError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, LedgerError> {
                let n: i64 = conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                    .map_err(|e| map_sqlite_error("count rows", e))?;
                Ok(n as u64)
            };

            let stats = DbStats {
                user_count: count("balances")?,
                transaction_count: count("transactions")?,
                phase_record_count: count("phase_records")?,
                unlock_count: count("achievement_unlocks")?,
            };
            debug!(?stats, "Ledger stats");
            Ok(stats)
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub user_count: u64,
    pub transaction_count: u64,
    pub phase_record_count: u64,
    pub unlock_count: u64,
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_db;
    use super::*;

    #[test]
    fn test_open_creates_empty_schema() {
        let (db, _dir) = temp_db();
        let stats = db.stats().unwrap();
        assert_eq!(stats.user_count, 0);
        assert_eq!(stats.transaction_count, 0);
        assert_eq!(stats.phase_record_count, 0);
        assert_eq!(stats.unlock_count, 0);
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let (db, dir) = temp_db();
        let path = db.path().to_path_buf();
        drop(db);
        let reopened = LedgerDb::open_at(path, Duration::from_secs(1)).unwrap();
        assert_eq!(reopened.stats().unwrap().user_count, 0);
        drop(dir);
    }

    #[test]
    fn test_failed_closure_rolls_back() {
        let (db, _dir) = temp_db();
        let result: Result<(), LedgerError> = db.with_write_tx(|tx| {
            tx.execute(
                "INSERT INTO balances (user_id, created_at, updated_at) VALUES ('u1', 'now', 'now')",
                [],
            )
            .map_err(|e| map_sqlite_error("insert", e))?;
            Err(LedgerError::Validation("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.stats().unwrap().user_count, 0);
    }

    #[test]
    fn test_busy_database_maps_to_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = LedgerDb::open(dir.path(), Duration::from_millis(50)).unwrap();

        // Hold the write lock on a separate connection
        let mut holder = Connection::open(db.path()).unwrap();
        let _guard = holder
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();

        let err = db.with_write_tx(|_| Ok(())).unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyTimeout(_)), "got {:?}", err);
        assert!(err.is_retryable());
    }
}
