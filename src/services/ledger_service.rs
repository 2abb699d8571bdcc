//! Ledger service - balance reads, audit replay, and non-phase adjustments
//!
//! Phase bonuses and achievement rewards are posted by their own engines.
//! Everything else that moves tokens (challenge and reaction rewards,
//! redemptions, admin corrections) comes through `record_adjustment`.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::models::{AchievementUnlockRow, BalanceRow, NewLedgerEntry, PhaseRecordRow, TransactionKind, TransactionRow};
use crate::db::transactions::{self, Reconstruction, ReplayedBalance};
use crate::db::{achievement_unlocks, balances, map_sqlite_error, phase_records, DbStats, LedgerDb};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};

/// Input for a non-phase credit or debit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAdjustment {
    pub user_id: String,
    pub kind: TransactionKind,
    /// Positive credits, negative debits
    pub amount: i64,
    pub source_id: String,
    pub source_type: String,
    pub actor_id: String,
    /// Repeating a key returns the original entry instead of posting twice
    pub idempotency_key: Option<String>,
    pub note: Option<String>,
}

/// Stored balance compared against a replay of the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub user_id: String,
    pub stored: BalanceRow,
    pub replayed: ReplayedBalance,
    pub transaction_count: usize,
    pub broken_links: Vec<String>,
    pub consistent: bool,
}

pub struct LedgerService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
}

impl LedgerService {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Current balance; unknown users read as zero
    pub fn get_balance(&self, user_id: &str) -> Result<BalanceRow, LedgerError> {
        let balance = self.db.with_conn(|conn| balances::get_balance(conn, user_id))?;
        Ok(balance.unwrap_or_else(|| BalanceRow::empty(user_id)))
    }

    /// Full log for a user in replay order
    pub fn history(&self, user_id: &str) -> Result<Vec<TransactionRow>, LedgerError> {
        self.db.with_conn(|conn| transactions::list_for_user(conn, user_id))
    }

    pub fn records(&self, owner_id: &str) -> Result<Vec<PhaseRecordRow>, LedgerError> {
        self.db.with_conn(|conn| phase_records::list_for_owner(conn, owner_id))
    }

    pub fn unlocks(&self, user_id: &str) -> Result<Vec<AchievementUnlockRow>, LedgerError> {
        self.db
            .with_conn(|conn| achievement_unlocks::list_for_user(conn, user_id))
    }

    pub fn stats(&self) -> Result<DbStats, LedgerError> {
        self.db.stats()
    }

    pub fn reconstruct_balance(&self, user_id: &str) -> Result<Reconstruction, LedgerError> {
        self.db.with_conn(|conn| transactions::reconstruct(conn, user_id))
    }

    /// Compare the cached balance with a replay of the log.
    ///
    /// Both are read on one connection, inside one read transaction, so a
    /// concurrent writer cannot land between the two reads.
    pub fn reconcile(&self, user_id: &str) -> Result<ReconciliationReport, LedgerError> {
        let (stored, replay) = self.db.with_conn(|conn| {
            // Deferred, dropped without commit
            let snapshot = conn
                .unchecked_transaction()
                .map_err(|e| map_sqlite_error("begin read", e))?;
            let stored = balances::get_balance(&snapshot, user_id)?
                .unwrap_or_else(|| BalanceRow::empty(user_id));
            let replay = transactions::reconstruct(&snapshot, user_id)?;
            Ok((stored, replay))
        })?;

        let consistent = replay.broken_links.is_empty()
            && replay.balance.current == stored.current_balance
            && replay.balance.earned == stored.total_earned
            && replay.balance.spent == stored.total_spent;

        let report = ReconciliationReport {
            user_id: user_id.to_string(),
            transaction_count: replay.transactions.len(),
            stored,
            replayed: replay.balance,
            broken_links: replay.broken_links,
            consistent,
        };

        if report.consistent {
            debug!(user_id = %user_id, balance = report.stored.current_balance, "Balance reconciles");
        } else {
            warn!(
                user_id = %user_id,
                stored = report.stored.current_balance,
                replayed = report.replayed.current,
                broken_links = report.broken_links.len(),
                "Balance does not match transaction log"
            );
        }

        Ok(report)
    }

    /// Reconcile every user that has a balance row
    pub fn reconcile_all(&self) -> Result<Vec<ReconciliationReport>, LedgerError> {
        let users = self.db.with_conn(balances::list_user_ids)?;
        users.iter().map(|user_id| self.reconcile(user_id)).collect()
    }

    /// Post a non-phase credit or debit
    pub fn record_adjustment(&self, adjustment: NewAdjustment) -> Result<TransactionRow, LedgerError> {
        if adjustment.kind.is_engine_owned() {
            return Err(LedgerError::InvalidInput(format!(
                "{} entries are posted by the award engine only",
                adjustment.kind
            )));
        }
        if adjustment.user_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("user_id is required".into()));
        }
        if adjustment.amount == 0 {
            return Err(LedgerError::InvalidInput("amount must be non-zero".into()));
        }
        if let Some(key) = adjustment.idempotency_key.as_deref() {
            if transactions::is_reserved_key(key) {
                return Err(LedgerError::InvalidInput(format!(
                    "Idempotency key {} uses a namespace reserved for phase and achievement rewards",
                    key
                )));
            }
        }
        match adjustment.kind {
            TransactionKind::RedemptionDebit if adjustment.amount > 0 => {
                return Err(LedgerError::InvalidInput("redemption must be a debit".into()));
            }
            TransactionKind::ChallengeReward | TransactionKind::ReactionReward if adjustment.amount < 0 => {
                return Err(LedgerError::InvalidInput(format!("{} must be a credit", adjustment.kind)));
            }
            _ => {}
        }

        let (row, posted) = self.db.with_write_tx(|tx| {
            if let Some(key) = adjustment.idempotency_key.as_deref() {
                if let Some(existing) = transactions::get_by_idempotency_key(tx, key)? {
                    if existing.user_id != adjustment.user_id {
                        return Err(LedgerError::InvalidInput(format!(
                            "Idempotency key {} belongs to another user",
                            key
                        )));
                    }
                    return Ok((existing, false));
                }
            }

            let row = transactions::post_entry(
                tx,
                &NewLedgerEntry {
                    user_id: adjustment.user_id.clone(),
                    kind: adjustment.kind,
                    amount: adjustment.amount,
                    source_id: adjustment.source_id.clone(),
                    source_type: adjustment.source_type.clone(),
                    actor_id: adjustment.actor_id.clone(),
                    idempotency_key: adjustment.idempotency_key.clone(),
                    note: adjustment.note.clone(),
                },
            )?;
            Ok((row, true))
        })?;

        if posted {
            info!(
                user_id = %row.user_id,
                kind = %row.kind,
                amount = row.amount,
                new_balance = row.balance_after,
                "Balance adjusted"
            );
            self.events.emit(LedgerEvent::BalanceAdjusted {
                user_id: row.user_id.clone(),
                transaction_id: row.id.clone(),
                amount: row.amount,
                new_balance: row.balance_after,
            });
        } else {
            debug!(transaction_id = %row.id, "Adjustment already posted");
        }

        Ok(row)
    }
}
