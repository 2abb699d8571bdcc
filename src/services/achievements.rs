//! Achievement evaluator
//!
//! Judges a user's activity snapshot against a static catalog and unlocks
//! each newly satisfied achievement in its own write transaction. The
//! `(user_id, achievement_id)` primary key decides races: the loser's
//! `INSERT OR IGNORE` changes nothing and it writes no reward.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::db::achievement_unlocks::{self, UserActivity};
use crate::db::models::{AchievementUnlockRow, NewLedgerEntry, Phase, TransactionKind};
use crate::db::{transactions, LedgerDb};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};

/// `source_type` of achievement reward transactions
pub const ACHIEVEMENT_SOURCE: &str = "achievement";

/// Actor recorded on engine-issued rewards
pub const SYSTEM_ACTOR: &str = "system";

/// Predicate over a user's activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AchievementRequirement {
    CompletedPhases { phase: Phase, count: i64 },
    CompletedRecords { count: i64 },
    TotalEarned { at_least: i64 },
    TransactionCount { kind: TransactionKind, count: i64 },
}

impl AchievementRequirement {
    pub fn is_met(&self, activity: &UserActivity) -> bool {
        match self {
            Self::CompletedPhases { phase, count } => activity.phase_count(*phase) >= *count,
            Self::CompletedRecords { count } => activity.completed_records >= *count,
            Self::TotalEarned { at_least } => activity.total_earned >= *at_least,
            Self::TransactionCount { kind, count } => activity.kind_count(*kind) >= *count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievementDefinition {
    pub id: String,
    pub name: String,
    pub requirement: AchievementRequirement,
    pub reward: i64,
}

impl AchievementDefinition {
    pub fn new(id: &str, name: &str, requirement: AchievementRequirement, reward: i64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            requirement,
            reward,
        }
    }
}

/// Built-in catalog
pub fn default_catalog() -> Vec<AchievementDefinition> {
    vec![
        AchievementDefinition::new(
            "first_steps",
            "First Steps",
            AchievementRequirement::CompletedPhases {
                phase: Phase::Preparation,
                count: 1,
            },
            10,
        ),
        AchievementDefinition::new(
            "thoughtful_reflector",
            "Thoughtful Reflector",
            AchievementRequirement::CompletedPhases {
                phase: Phase::Reflection,
                count: 3,
            },
            30,
        ),
        AchievementDefinition::new(
            "kindness_in_action",
            "Kindness in Action",
            AchievementRequirement::CompletedPhases {
                phase: Phase::Demonstration,
                count: 1,
            },
            20,
        ),
        AchievementDefinition::new(
            "full_circle",
            "Full Circle",
            AchievementRequirement::CompletedRecords { count: 1 },
            50,
        ),
        AchievementDefinition::new(
            "token_collector",
            "Token Collector",
            AchievementRequirement::TotalEarned { at_least: 500 },
            100,
        ),
    ]
}

/// Reject catalogs the evaluator cannot run
pub fn validate_catalog(definitions: &[AchievementDefinition]) -> Result<(), LedgerError> {
    let mut seen = std::collections::HashSet::new();
    for def in definitions {
        if def.id.trim().is_empty() {
            return Err(LedgerError::Config("Achievement id must not be empty".into()));
        }
        if def.id.contains(':') {
            return Err(LedgerError::Config(format!(
                "Achievement id {} must not contain ':'",
                def.id
            )));
        }
        if def.reward <= 0 {
            return Err(LedgerError::Config(format!(
                "Achievement {} must have a positive reward",
                def.id
            )));
        }
        if !seen.insert(def.id.as_str()) {
            return Err(LedgerError::Config(format!("Duplicate achievement id {}", def.id)));
        }
    }
    Ok(())
}

/// Outcome for one newly satisfied achievement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnlockResult {
    pub achievement_id: String,
    /// False when a concurrent evaluation committed the unlock first
    pub unlocked: bool,
    pub reward: i64,
    pub new_balance: Option<i64>,
}

pub struct AchievementEvaluator {
    db: Arc<LedgerDb>,
    definitions: Vec<AchievementDefinition>,
    events: Arc<EventBus>,
}

impl AchievementEvaluator {
    pub fn new(
        db: Arc<LedgerDb>,
        definitions: Vec<AchievementDefinition>,
        events: Arc<EventBus>,
    ) -> Result<Self, LedgerError> {
        validate_catalog(&definitions)?;
        Ok(Self {
            db,
            definitions,
            events,
        })
    }

    pub fn definitions(&self) -> &[AchievementDefinition] {
        &self.definitions
    }

    pub fn unlocks(&self, user_id: &str) -> Result<Vec<AchievementUnlockRow>, LedgerError> {
        self.db
            .with_conn(|conn| achievement_unlocks::list_for_user(conn, user_id))
    }

    /// Unlock everything the user now qualifies for.
    ///
    /// Rewards count toward `TotalEarned`, so evaluation repeats until a
    /// pass unlocks nothing. Each pass either unlocks something or stops,
    /// which bounds the loop by the catalog size.
    pub fn evaluate(&self, user_id: &str) -> Result<Vec<UnlockResult>, LedgerError> {
        let mut results = Vec::new();

        for _ in 0..=self.definitions.len() {
            let (activity, unlocked) = self.db.with_conn(|conn| {
                let activity = achievement_unlocks::user_activity(conn, user_id)?;
                let unlocked: Vec<String> = achievement_unlocks::list_for_user(conn, user_id)?
                    .into_iter()
                    .map(|u| u.achievement_id)
                    .collect();
                Ok((activity, unlocked))
            })?;

            let candidates: Vec<&AchievementDefinition> = self
                .definitions
                .iter()
                .filter(|d| !unlocked.contains(&d.id))
                .filter(|d| !results.iter().any(|r: &UnlockResult| r.achievement_id == d.id))
                .filter(|d| d.requirement.is_met(&activity))
                .collect();

            if candidates.is_empty() {
                break;
            }

            let mut progressed = false;
            for def in candidates {
                let result = self.unlock(user_id, def)?;
                progressed |= result.unlocked;
                results.push(result);
            }
            if !progressed {
                break;
            }
        }

        Ok(results)
    }

    fn unlock(&self, user_id: &str, def: &AchievementDefinition) -> Result<UnlockResult, LedgerError> {
        let entry = self.db.with_write_tx(|tx| {
            if !achievement_unlocks::insert_unlock(tx, user_id, &def.id, def.reward)? {
                return Ok(None);
            }
            let entry = transactions::post_entry(
                tx,
                &NewLedgerEntry {
                    user_id: user_id.to_string(),
                    kind: TransactionKind::AchievementUnlock,
                    amount: def.reward,
                    source_id: def.id.clone(),
                    source_type: ACHIEVEMENT_SOURCE.to_string(),
                    actor_id: SYSTEM_ACTOR.to_string(),
                    idempotency_key: Some(transactions::achievement_key(user_id, &def.id)),
                    note: Some(def.name.clone()),
                },
            )?;
            Ok(Some(entry))
        })?;

        match entry {
            Some(entry) => {
                info!(user_id = %user_id, achievement = %def.id, reward = def.reward, "Achievement unlocked");
                self.events.emit(LedgerEvent::AchievementUnlocked {
                    user_id: user_id.to_string(),
                    achievement_id: def.id.clone(),
                    reward: def.reward,
                    new_balance: entry.balance_after,
                });
                Ok(UnlockResult {
                    achievement_id: def.id.clone(),
                    unlocked: true,
                    reward: def.reward,
                    new_balance: Some(entry.balance_after),
                })
            }
            None => {
                debug!(user_id = %user_id, achievement = %def.id, "Achievement already unlocked");
                Ok(UnlockResult {
                    achievement_id: def.id.clone(),
                    unlocked: false,
                    reward: 0,
                    new_balance: None,
                })
            }
        }
    }
}

/// Evaluate achievements for every credited user seen on the bus.
///
/// Evaluation is blocking SQLite work, so it runs on the blocking pool.
pub fn spawn_achievement_listener(
    event_bus: Arc<EventBus>,
    evaluator: Arc<AchievementEvaluator>,
) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    // Own unlocks would only re-trigger a no-op pass
                    if matches!(event, LedgerEvent::AchievementUnlocked { .. }) {
                        continue;
                    }
                    let Some(user_id) = event.credited_user().map(str::to_string) else {
                        continue;
                    };
                    let evaluator = evaluator.clone();
                    let outcome = tokio::task::spawn_blocking(move || evaluator.evaluate(&user_id)).await;
                    match outcome {
                        Ok(Ok(results)) => {
                            debug!(unlocked = results.iter().filter(|r| r.unlocked).count(), "Achievement pass done");
                        }
                        Ok(Err(e)) => warn!(error = %e, "Achievement evaluation failed"),
                        Err(e) => warn!(error = %e, "Achievement evaluation task panicked"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Achievement listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping achievement listener");
                    break;
                }
            }
        }
    })
}
