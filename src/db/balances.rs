//! Balance store operations
//!
//! Rows here are a cache of the transaction log. Mutations only happen
//! inside a write transaction that also appends the matching log entry;
//! see [`super::transactions::post_entry`].

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;

use super::map_sqlite_error;
use super::models::{current_timestamp, BalanceDelta, BalanceRow};
use crate::error::LedgerError;

impl BalanceRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            user_id: row.get("user_id")?,
            current_balance: row.get("current_balance")?,
            total_earned: row.get("total_earned")?,
            total_spent: row.get("total_spent")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Get the balance row for a user, if any activity has created one
pub fn get_balance(conn: &Connection, user_id: &str) -> Result<Option<BalanceRow>, LedgerError> {
    conn.query_row(
        "SELECT * FROM balances WHERE user_id = ?",
        params![user_id],
        BalanceRow::from_row,
    )
    .optional()
    .map_err(|e| map_sqlite_error("load balance", e))
}

/// List all user ids that have a balance row
pub fn list_user_ids(conn: &Connection) -> Result<Vec<String>, LedgerError> {
    let mut stmt = conn
        .prepare("SELECT user_id FROM balances ORDER BY user_id")
        .map_err(|e| map_sqlite_error("prepare user list", e))?;

    let ids = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| map_sqlite_error("list users", e))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(|e| map_sqlite_error("read user id", e))?;

    Ok(ids)
}

/// Load the balance row, creating a zero row on first activity
pub fn ensure_balance(tx: &Transaction<'_>, user_id: &str) -> Result<BalanceRow, LedgerError> {
    let now = current_timestamp();
    let inserted = tx
        .execute(
            "INSERT OR IGNORE INTO balances (user_id, created_at, updated_at) VALUES (?, ?, ?)",
            params![user_id, now, now],
        )
        .map_err(|e| map_sqlite_error("create balance", e))?;

    if inserted > 0 {
        debug!(user_id = %user_id, "Created balance row");
    }

    get_balance(tx, user_id)?
        .ok_or_else(|| LedgerError::Persistence(format!("Balance for {} missing after insert", user_id)))
}

/// Apply a signed delta to a user's balance.
///
/// Debits that would take the balance below zero fail with
/// `InsufficientBalance` and write nothing. The caller appends the log entry
/// in the same transaction.
pub fn apply_delta(
    tx: &Transaction<'_>,
    user_id: &str,
    amount: i64,
) -> Result<BalanceDelta, LedgerError> {
    if amount == 0 {
        return Err(LedgerError::InvalidInput("Balance delta must be non-zero".into()));
    }

    let before = ensure_balance(tx, user_id)?;
    before.check_invariants()?;

    let current_balance = before
        .current_balance
        .checked_add(amount)
        .ok_or_else(|| LedgerError::InvalidInput(format!("Balance overflow for {}", user_id)))?;

    if current_balance < 0 {
        return Err(LedgerError::InsufficientBalance {
            user_id: user_id.to_string(),
            balance: before.current_balance,
            requested: amount,
        });
    }

    let (total_earned, total_spent) = if amount > 0 {
        (before.total_earned + amount, before.total_spent)
    } else {
        (before.total_earned, before.total_spent - amount)
    };

    let after = BalanceRow {
        user_id: before.user_id.clone(),
        current_balance,
        total_earned,
        total_spent,
        created_at: before.created_at.clone(),
        updated_at: current_timestamp(),
    };
    after.check_invariants()?;

    tx.execute(
        r#"
        UPDATE balances
        SET current_balance = ?, total_earned = ?, total_spent = ?, updated_at = ?
        WHERE user_id = ?
        "#,
        params![
            after.current_balance,
            after.total_earned,
            after.total_spent,
            after.updated_at,
            user_id,
        ],
    )
    .map_err(|e| map_sqlite_error("update balance", e))?;

    Ok(BalanceDelta {
        balance_before: before.current_balance,
        balance: after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    #[test]
    fn test_unknown_user_has_no_row() {
        let (db, _dir) = temp_db();
        let row = db.with_conn(|conn| get_balance(conn, "nobody")).unwrap();
        assert!(row.is_none());
    }

    #[test]
    fn test_credit_then_debit_updates_totals() {
        let (db, _dir) = temp_db();

        let credit = db.with_write_tx(|tx| apply_delta(tx, "u1", 100)).unwrap();
        assert_eq!(credit.balance_before, 0);
        assert_eq!(credit.balance.current_balance, 100);
        assert_eq!(credit.balance.total_earned, 100);

        let debit = db.with_write_tx(|tx| apply_delta(tx, "u1", -30)).unwrap();
        assert_eq!(debit.balance_before, 100);
        assert_eq!(debit.balance.current_balance, 70);
        assert_eq!(debit.balance.total_earned, 100);
        assert_eq!(debit.balance.total_spent, 30);

        let stored = db.with_conn(|conn| get_balance(conn, "u1")).unwrap().unwrap();
        assert_eq!(stored, debit.balance);
    }

    #[test]
    fn test_overdraw_is_rejected_without_change() {
        let (db, _dir) = temp_db();
        db.with_write_tx(|tx| apply_delta(tx, "u1", 10)).unwrap();

        let err = db.with_write_tx(|tx| apply_delta(tx, "u1", -11)).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientBalance { balance: 10, requested: -11, .. }
        ));

        let stored = db.with_conn(|conn| get_balance(conn, "u1")).unwrap().unwrap();
        assert_eq!(stored.current_balance, 10);
        assert_eq!(stored.total_spent, 0);
    }

    #[test]
    fn test_zero_delta_rejected() {
        let (db, _dir) = temp_db();
        let err = db.with_write_tx(|tx| apply_delta(tx, "u1", 0)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));
    }

    #[test]
    fn test_balance_rows_cannot_be_deleted() {
        let (db, _dir) = temp_db();
        db.with_write_tx(|tx| ensure_balance(tx, "u1")).unwrap();

        let err = db
            .with_write_tx(|tx| {
                tx.execute("DELETE FROM balances WHERE user_id = 'u1'", [])
                    .map_err(|e| map_sqlite_error("delete balance", e))
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(_)));
        assert_eq!(db.with_conn(list_user_ids).unwrap(), vec!["u1".to_string()]);
    }
}
