//! Database schema definitions

use rusqlite::{Connection, TransactionBehavior};
use tracing::info;

use super::map_sqlite_error;
use crate::error::LedgerError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// The version check, table creation and version write share one
/// immediate transaction, so concurrent openers see either no schema or
/// the whole schema with exactly one version row.
pub fn init_schema(conn: &mut Connection) -> Result<(), LedgerError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| map_sqlite_error("lock schema", e))?;

    let current_version = get_schema_version(&tx)?;

    if current_version == 0 {
        info!("Creating new ledger schema v{}", SCHEMA_VERSION);
        create_tables(&tx)?;
        set_schema_version(&tx, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(&tx, current_version)?;
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    tx.commit().map_err(|e| map_sqlite_error("commit schema", e))
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| map_sqlite_error("create schema_version table", e))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(map_sqlite_error("read schema_version", other)),
        })?;

    Ok(version.unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| map_sqlite_error("clear schema_version", e))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| map_sqlite_error("set schema_version", e))?;
    Ok(())
}

/// Create all tables; runs inside the caller's schema transaction
fn create_tables(conn: &Connection) -> Result<(), LedgerError> {
    let batch = format!(
        "{}\n{}\n{}\n{}\n{}",
        BALANCES_SCHEMA, TRANSACTIONS_SCHEMA, PHASE_RECORDS_SCHEMA, PHASE_EVENTS_SCHEMA,
        ACHIEVEMENT_UNLOCKS_SCHEMA
    );
    conn.execute_batch(&batch)
        .map_err(|e| map_sqlite_error("create ledger tables", e))
}

/// Migrate schema from older version
fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), LedgerError> {
    // Only v1 exists so far; future steps match on from_version here.
    info!(from_version, "No migration steps registered");
    set_schema_version(conn, SCHEMA_VERSION)
}

/// One row per user; the cached spendable balance
const BALANCES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS balances (
    user_id TEXT PRIMARY KEY NOT NULL,
    current_balance INTEGER NOT NULL DEFAULT 0,
    total_earned INTEGER NOT NULL DEFAULT 0,
    total_spent INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (current_balance >= 0),
    CHECK (total_earned >= 0 AND total_spent >= 0),
    CHECK (current_balance = total_earned - total_spent)
);

CREATE TRIGGER IF NOT EXISTS balances_no_delete
BEFORE DELETE ON balances
BEGIN
    SELECT RAISE(ABORT, 'balances are never deleted');
END;
"#;

/// Append-only transaction log; seq is the replay order
const TRANSACTIONS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL,
    source_id TEXT NOT NULL,
    source_type TEXT NOT NULL,
    balance_before INTEGER NOT NULL,
    balance_after INTEGER NOT NULL,
    actor_id TEXT NOT NULL,
    idempotency_key TEXT UNIQUE,
    note TEXT,
    created_at TEXT NOT NULL,
    CHECK (balance_after = balance_before + amount),
    CHECK (amount <> 0)
);

CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id, seq);
CREATE INDEX IF NOT EXISTS idx_transactions_source ON transactions(source_type, source_id);

CREATE TRIGGER IF NOT EXISTS transactions_no_update
BEFORE UPDATE ON transactions
BEGIN
    SELECT RAISE(ABORT, 'transactions are append-only');
END;

CREATE TRIGGER IF NOT EXISTS transactions_no_delete
BEFORE DELETE ON transactions
BEGIN
    SELECT RAISE(ABORT, 'transactions are append-only');
END;
"#;

/// One row per submission, one flag/timestamp/actor/amount group per phase
const PHASE_RECORDS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS phase_records (
    id TEXT PRIMARY KEY NOT NULL,
    owner_id TEXT NOT NULL,

    preparation_completed INTEGER NOT NULL DEFAULT 0,
    preparation_completed_at TEXT,
    preparation_completed_by TEXT,
    preparation_bonus INTEGER NOT NULL DEFAULT 0,

    reflection_completed INTEGER NOT NULL DEFAULT 0,
    reflection_completed_at TEXT,
    reflection_completed_by TEXT,
    reflection_bonus INTEGER NOT NULL DEFAULT 0,

    demonstration_completed INTEGER NOT NULL DEFAULT 0,
    demonstration_completed_at TEXT,
    demonstration_completed_by TEXT,
    demonstration_bonus INTEGER NOT NULL DEFAULT 0,

    reflection_text TEXT,
    evidence_ref TEXT,
    bonus_total INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (bonus_total = preparation_bonus + reflection_bonus + demonstration_bonus)
);

CREATE INDEX IF NOT EXISTS idx_phase_records_owner ON phase_records(owner_id);

CREATE TRIGGER IF NOT EXISTS phase_records_no_reset
BEFORE UPDATE ON phase_records
WHEN (OLD.preparation_completed = 1 AND NEW.preparation_completed = 0)
  OR (OLD.reflection_completed = 1 AND NEW.reflection_completed = 0)
  OR (OLD.demonstration_completed = 1 AND NEW.demonstration_completed = 0)
  OR NEW.bonus_total < OLD.bonus_total
BEGIN
    SELECT RAISE(ABORT, 'phase flags are never reset');
END;
"#;

/// Compliance trail, distinct from the transaction log
const PHASE_EVENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS phase_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL,
    phase TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    note TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (record_id) REFERENCES phase_records(id)
);

CREATE INDEX IF NOT EXISTS idx_phase_events_record ON phase_events(record_id, seq);

CREATE TRIGGER IF NOT EXISTS phase_events_no_update
BEFORE UPDATE ON phase_events
BEGIN
    SELECT RAISE(ABORT, 'phase events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS phase_events_no_delete
BEFORE DELETE ON phase_events
BEGIN
    SELECT RAISE(ABORT, 'phase events are append-only');
END;
"#;

/// Unique (user_id, achievement_id) is the double-unlock guard
const ACHIEVEMENT_UNLOCKS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS achievement_unlocks (
    user_id TEXT NOT NULL,
    achievement_id TEXT NOT NULL,
    reward INTEGER NOT NULL,
    unlocked_at TEXT NOT NULL,
    PRIMARY KEY (user_id, achievement_id)
);

CREATE TRIGGER IF NOT EXISTS achievement_unlocks_no_update
BEFORE UPDATE ON achievement_unlocks
BEGIN
    SELECT RAISE(ABORT, 'achievement unlocks are append-only');
END;

CREATE TRIGGER IF NOT EXISTS achievement_unlocks_no_delete
BEFORE DELETE ON achievement_unlocks
BEGIN
    SELECT RAISE(ABORT, 'achievement unlocks are append-only');
END;
"#;
