//! Typed row definitions for the ledger tables
//!
//! Every entity the ledger persists has a fixed-shape struct here, with the
//! invariant checks that must hold before a row is written.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Get current UTC timestamp as ISO 8601 string for SQLite TEXT columns
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// ============================================================================
// Phases
// ============================================================================

/// Named verification phases of a phase record, in display order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preparation,
    Reflection,
    Demonstration,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Preparation, Phase::Reflection, Phase::Demonstration];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preparation => "preparation",
            Phase::Reflection => "reflection",
            Phase::Demonstration => "demonstration",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| LedgerError::InvalidInput(format!("Unknown phase: {}", s)))
    }
}

// ============================================================================
// Transaction kinds
// ============================================================================

/// What caused a balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    PhaseBonus,
    AchievementUnlock,
    ChallengeReward,
    ReactionReward,
    RedemptionDebit,
    AdminAdjustment,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 6] = [
        TransactionKind::PhaseBonus,
        TransactionKind::AchievementUnlock,
        TransactionKind::ChallengeReward,
        TransactionKind::ReactionReward,
        TransactionKind::RedemptionDebit,
        TransactionKind::AdminAdjustment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::PhaseBonus => "phase_bonus",
            TransactionKind::AchievementUnlock => "achievement_unlock",
            TransactionKind::ChallengeReward => "challenge_reward",
            TransactionKind::ReactionReward => "reaction_reward",
            TransactionKind::RedemptionDebit => "redemption_debit",
            TransactionKind::AdminAdjustment => "admin_adjustment",
        }
    }

    /// Kinds only the award coordinator and achievement evaluator may post
    pub fn is_engine_owned(&self) -> bool {
        matches!(self, TransactionKind::PhaseBonus | TransactionKind::AchievementUnlock)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| LedgerError::InvalidInput(format!("Unknown transaction kind: {}", s)))
    }
}

// ============================================================================
// Actors
// ============================================================================

/// Role of the caller as supplied by the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Owner,
    Verifier,
    Admin,
}

/// Authenticated caller of a ledger operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: ActorRole) -> Self {
        Self { id: id.into(), role }
    }

    pub fn owner(id: impl Into<String>) -> Self {
        Self::new(id, ActorRole::Owner)
    }

    pub fn verifier(id: impl Into<String>) -> Self {
        Self::new(id, ActorRole::Verifier)
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, ActorRole::Admin)
    }

    /// Verifier-level roles may approve someone else's work
    pub fn can_verify(&self) -> bool {
        matches!(self.role, ActorRole::Verifier | ActorRole::Admin)
    }
}

// ============================================================================
// Balances
// ============================================================================

/// Cached per-user balance row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub user_id: String,
    pub current_balance: i64,
    pub total_earned: i64,
    pub total_spent: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl BalanceRow {
    /// Zero balance for a user with no activity yet (not persisted)
    pub fn empty(user_id: impl Into<String>) -> Self {
        let now = current_timestamp();
        Self {
            user_id: user_id.into(),
            current_balance: 0,
            total_earned: 0,
            total_spent: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        if self.current_balance != self.total_earned - self.total_spent {
            return Err(LedgerError::Persistence(format!(
                "Balance for {} drifted: current {} != earned {} - spent {}",
                self.user_id, self.current_balance, self.total_earned, self.total_spent
            )));
        }
        if self.current_balance < 0 {
            return Err(LedgerError::Persistence(format!(
                "Balance for {} is negative: {}",
                self.user_id, self.current_balance
            )));
        }
        Ok(())
    }
}

/// Result of applying one delta to a balance row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDelta {
    pub balance_before: i64,
    pub balance: BalanceRow,
}

// ============================================================================
// Transactions
// ============================================================================

/// Immutable transaction log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub id: String,
    pub seq: i64,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub source_id: String,
    pub source_type: String,
    pub balance_before: i64,
    pub balance_after: i64,
    pub actor_id: String,
    pub idempotency_key: Option<String>,
    pub note: Option<String>,
    pub created_at: String,
}

/// A transaction ready to append; balances are already computed
#[derive(Debug, Clone)]
pub struct NewTransaction<'a> {
    pub user_id: &'a str,
    pub kind: TransactionKind,
    pub amount: i64,
    pub source_id: &'a str,
    pub source_type: &'a str,
    pub balance_before: i64,
    pub balance_after: i64,
    pub actor_id: &'a str,
    pub idempotency_key: Option<&'a str>,
    pub note: Option<&'a str>,
}

impl NewTransaction<'_> {
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        if self.balance_after != self.balance_before + self.amount {
            return Err(LedgerError::Persistence(format!(
                "Transaction for {} does not add up: {} + {} != {}",
                self.user_id, self.balance_before, self.amount, self.balance_after
            )));
        }
        Ok(())
    }
}

/// A balance mutation request: one credit or debit plus its log entry
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub source_id: String,
    pub source_type: String,
    pub actor_id: String,
    pub idempotency_key: Option<String>,
    pub note: Option<String>,
}

// ============================================================================
// Phase records
// ============================================================================

/// Completion state of a single phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub completed: bool,
    pub completed_at: Option<String>,
    pub completed_by: Option<String>,
    pub bonus_awarded: i64,
}

/// Derived status of a phase record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    NotStarted,
    InProgress,
    Complete,
}

/// Multi-step verification submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecordRow {
    pub id: String,
    pub owner_id: String,
    pub preparation: PhaseState,
    pub reflection: PhaseState,
    pub demonstration: PhaseState,
    pub reflection_text: Option<String>,
    pub evidence_ref: Option<String>,
    pub bonus_total: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl PhaseRecordRow {
    pub fn phase(&self, phase: Phase) -> &PhaseState {
        match phase {
            Phase::Preparation => &self.preparation,
            Phase::Reflection => &self.reflection,
            Phase::Demonstration => &self.demonstration,
        }
    }

    pub fn status(&self) -> RecordStatus {
        let done = Phase::ALL.iter().filter(|p| self.phase(**p).completed).count();
        match done {
            0 => RecordStatus::NotStarted,
            n if n == Phase::ALL.len() => RecordStatus::Complete,
            _ => RecordStatus::InProgress,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status() == RecordStatus::Complete
    }

    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let sum: i64 = Phase::ALL
            .iter()
            .map(|p| self.phase(*p))
            .filter(|s| s.completed)
            .map(|s| s.bonus_awarded)
            .sum();
        if sum != self.bonus_total {
            return Err(LedgerError::Persistence(format!(
                "Phase record {} bonus total {} != sum of awarded phases {}",
                self.id, self.bonus_total, sum
            )));
        }
        Ok(())
    }
}

/// Append-only compliance trail entry for a phase completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEventRow {
    pub seq: i64,
    pub record_id: String,
    pub phase: Phase,
    pub actor_id: String,
    pub note: Option<String>,
    pub created_at: String,
}

// ============================================================================
// Achievements
// ============================================================================

/// One-time achievement unlock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievementUnlockRow {
    pub user_id: String,
    pub achievement_id: String,
    pub reward: i64,
    pub unlocked_at: String,
}
