//! Achievement unlock rows and the activity snapshot achievements are judged on

use std::collections::HashMap;

use rusqlite::{params, Connection, Row, Transaction};
use serde::Serialize;

use super::models::{current_timestamp, AchievementUnlockRow, Phase, TransactionKind};
use super::{balances, map_sqlite_error, transactions};
use crate::error::LedgerError;

impl AchievementUnlockRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            user_id: row.get("user_id")?,
            achievement_id: row.get("achievement_id")?,
            reward: row.get("reward")?,
            unlocked_at: row.get("unlocked_at")?,
        })
    }
}

/// Aggregated history of one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserActivity {
    pub user_id: String,
    pub completed_phases: HashMap<Phase, i64>,
    pub completed_records: i64,
    pub total_earned: i64,
    pub transactions_by_kind: HashMap<TransactionKind, i64>,
}

impl UserActivity {
    pub fn phase_count(&self, phase: Phase) -> i64 {
        self.completed_phases.get(&phase).copied().unwrap_or(0)
    }

    pub fn kind_count(&self, kind: TransactionKind) -> i64 {
        self.transactions_by_kind.get(&kind).copied().unwrap_or(0)
    }
}

/// Insert an unlock row unless one already exists.
///
/// Returns `false` when the (user, achievement) pair was already unlocked;
/// the caller must then write nothing else for this achievement.
pub fn insert_unlock(
    tx: &Transaction<'_>,
    user_id: &str,
    achievement_id: &str,
    reward: i64,
) -> Result<bool, LedgerError> {
    let inserted = tx
        .execute(
            "INSERT OR IGNORE INTO achievement_unlocks (user_id, achievement_id, reward, unlocked_at) VALUES (?, ?, ?, ?)",
            params![user_id, achievement_id, reward, current_timestamp()],
        )
        .map_err(|e| map_sqlite_error("insert achievement unlock", e))?;

    Ok(inserted == 1)
}

/// All unlocks for a user, oldest first
pub fn list_for_user(conn: &Connection, user_id: &str) -> Result<Vec<AchievementUnlockRow>, LedgerError> {
    let mut stmt = conn
        .prepare("SELECT * FROM achievement_unlocks WHERE user_id = ? ORDER BY unlocked_at ASC, achievement_id")
        .map_err(|e| map_sqlite_error("prepare unlock list", e))?;

    let rows = stmt
        .query_map(params![user_id], AchievementUnlockRow::from_row)
        .map_err(|e| map_sqlite_error("list unlocks", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlite_error("read unlock", e))?;

    Ok(rows)
}

/// Build the activity snapshot for a user
pub fn user_activity(conn: &Connection, user_id: &str) -> Result<UserActivity, LedgerError> {
    let (prep, refl, demo, complete): (Option<i64>, Option<i64>, Option<i64>, Option<i64>) = conn
        .query_row(
            r#"
            SELECT
                SUM(preparation_completed),
                SUM(reflection_completed),
                SUM(demonstration_completed),
                SUM(preparation_completed AND reflection_completed AND demonstration_completed)
            FROM phase_records
            WHERE owner_id = ?
            "#,
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(|e| map_sqlite_error("aggregate phase records", e))?;

    let completed_phases = HashMap::from([
        (Phase::Preparation, prep.unwrap_or(0)),
        (Phase::Reflection, refl.unwrap_or(0)),
        (Phase::Demonstration, demo.unwrap_or(0)),
    ]);

    let total_earned = balances::get_balance(conn, user_id)?
        .map(|b| b.total_earned)
        .unwrap_or(0);

    let transactions_by_kind = transactions::count_by_kind(conn, user_id)?
        .into_iter()
        .collect();

    Ok(UserActivity {
        user_id: user_id.to_string(),
        completed_phases,
        completed_records: complete.unwrap_or(0),
        total_earned,
        transactions_by_kind,
    })
}
