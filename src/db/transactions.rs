//! Transaction log operations
//!
//! The log is append-only: rows are inserted once and the table's triggers
//! abort any UPDATE or DELETE. Folding a user's rows in `seq` order from zero
//! reproduces the cached balance.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::balances;
use super::map_sqlite_error;
use super::models::{current_timestamp, NewLedgerEntry, NewTransaction, Phase, TransactionKind, TransactionRow};
use crate::error::LedgerError;

/// Key namespaces owned by the award engine. Caller keys may not use them.
pub const RESERVED_KEY_PREFIXES: [&str; 2] = ["phase:", "achievement:"];

/// Idempotency key of a phase bonus
pub fn phase_bonus_key(record_id: &str, phase: Phase) -> String {
    format!("phase:{}:{}", record_id, phase)
}

/// Idempotency key of an achievement reward. Achievement ids never contain
/// `:`, so the last segment identifies the achievement unambiguously.
pub fn achievement_key(user_id: &str, achievement_id: &str) -> String {
    format!("achievement:{}:{}", user_id, achievement_id)
}

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEY_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

impl TransactionRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let kind: String = row.get("kind")?;
        let kind = kind.parse::<TransactionKind>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
            )
        })?;

        Ok(Self {
            id: row.get("id")?,
            seq: row.get("seq")?,
            user_id: row.get("user_id")?,
            kind,
            amount: row.get("amount")?,
            source_id: row.get("source_id")?,
            source_type: row.get("source_type")?,
            balance_before: row.get("balance_before")?,
            balance_after: row.get("balance_after")?,
            actor_id: row.get("actor_id")?,
            idempotency_key: row.get("idempotency_key")?,
            note: row.get("note")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Balance folded from the log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayedBalance {
    pub current: i64,
    pub earned: i64,
    pub spent: i64,
}

/// Output of a full replay of one user's log
#[derive(Debug, Clone, Serialize)]
pub struct Reconstruction {
    pub user_id: String,
    pub balance: ReplayedBalance,
    pub transactions: Vec<TransactionRow>,
    /// Ids of entries whose `balance_before` disagrees with the running fold
    pub broken_links: Vec<String>,
}

/// Append one entry to the log and return it as stored
pub fn append(tx: &Transaction<'_>, entry: &NewTransaction<'_>) -> Result<TransactionRow, LedgerError> {
    entry.check_invariants()?;

    let id = Uuid::new_v4().to_string();
    let created_at = current_timestamp();

    tx.execute(
        r#"
        INSERT INTO transactions (
            id, user_id, kind, amount, source_id, source_type,
            balance_before, balance_after, actor_id, idempotency_key, note, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            id,
            entry.user_id,
            entry.kind.as_str(),
            entry.amount,
            entry.source_id,
            entry.source_type,
            entry.balance_before,
            entry.balance_after,
            entry.actor_id,
            entry.idempotency_key,
            entry.note,
            created_at,
        ],
    )
    .map_err(|e| map_sqlite_error("append transaction", e))?;

    Ok(TransactionRow {
        id,
        seq: tx.last_insert_rowid(),
        user_id: entry.user_id.to_string(),
        kind: entry.kind,
        amount: entry.amount,
        source_id: entry.source_id.to_string(),
        source_type: entry.source_type.to_string(),
        balance_before: entry.balance_before,
        balance_after: entry.balance_after,
        actor_id: entry.actor_id.to_string(),
        idempotency_key: entry.idempotency_key.map(str::to_string),
        note: entry.note.map(str::to_string),
        created_at,
    })
}

/// Apply a balance delta and append its log entry in the caller's transaction.
///
/// Every credit and debit goes through here so a balance change can never be
/// written without its matching log entry.
pub fn post_entry(tx: &Transaction<'_>, entry: &NewLedgerEntry) -> Result<TransactionRow, LedgerError> {
    if let Some(key) = entry.idempotency_key.as_deref() {
        if let Some(existing) = get_by_idempotency_key(tx, key)? {
            return Err(LedgerError::Persistence(format!(
                "Idempotency key {} already posted as {}",
                key, existing.id
            )));
        }
    }

    let delta = balances::apply_delta(tx, &entry.user_id, entry.amount)?;

    let row = append(
        tx,
        &NewTransaction {
            user_id: &entry.user_id,
            kind: entry.kind,
            amount: entry.amount,
            source_id: &entry.source_id,
            source_type: &entry.source_type,
            balance_before: delta.balance_before,
            balance_after: delta.balance.current_balance,
            actor_id: &entry.actor_id,
            idempotency_key: entry.idempotency_key.as_deref(),
            note: entry.note.as_deref(),
        },
    )?;

    debug!(
        user_id = %row.user_id,
        kind = %row.kind,
        amount = row.amount,
        balance_after = row.balance_after,
        "Posted ledger entry"
    );

    Ok(row)
}

/// Look up an entry by its idempotency key
pub fn get_by_idempotency_key(conn: &Connection, key: &str) -> Result<Option<TransactionRow>, LedgerError> {
    conn.query_row(
        "SELECT * FROM transactions WHERE idempotency_key = ?",
        params![key],
        TransactionRow::from_row,
    )
    .optional()
    .map_err(|e| map_sqlite_error("load transaction by key", e))
}

/// All entries for a user in creation order
pub fn list_for_user(conn: &Connection, user_id: &str) -> Result<Vec<TransactionRow>, LedgerError> {
    let mut stmt = conn
        .prepare("SELECT * FROM transactions WHERE user_id = ? ORDER BY seq ASC")
        .map_err(|e| map_sqlite_error("prepare transaction list", e))?;

    let rows = stmt
        .query_map(params![user_id], TransactionRow::from_row)
        .map_err(|e| map_sqlite_error("list transactions", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlite_error("read transaction", e))?;

    Ok(rows)
}

/// Number of entries per kind for a user
pub fn count_by_kind(conn: &Connection, user_id: &str) -> Result<Vec<(TransactionKind, i64)>, LedgerError> {
    let mut stmt = conn
        .prepare("SELECT kind, COUNT(*) FROM transactions WHERE user_id = ? GROUP BY kind")
        .map_err(|e| map_sqlite_error("prepare kind counts", e))?;

    let raw = stmt
        .query_map(params![user_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|e| map_sqlite_error("count transactions", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlite_error("read kind count", e))?;

    raw.into_iter()
        .map(|(kind, n)| Ok::<_, LedgerError>((kind.parse::<TransactionKind>()?, n)))
        .collect()
}

/// Replay a user's log from zero
pub fn reconstruct(conn: &Connection, user_id: &str) -> Result<Reconstruction, LedgerError> {
    let transactions = list_for_user(conn, user_id)?;

    let mut balance = ReplayedBalance::default();
    let mut broken_links = vec![];

    for entry in &transactions {
        if entry.balance_before != balance.current {
            broken_links.push(entry.id.clone());
        }
        balance.current += entry.amount;
        if entry.amount > 0 {
            balance.earned += entry.amount;
        } else {
            balance.spent -= entry.amount;
        }
    }

    Ok(Reconstruction {
        user_id: user_id.to_string(),
        balance,
        transactions,
        broken_links,
    })
}
