//! Award coordinator - exactly-once phase bonuses
//!
//! Completing a phase, paying its bonus, logging the transaction and
//! appending the phase audit event happen in one write transaction:
//!
//! 1. Read the record without a lock. Reject early and run the content
//!    classifier here, so no external call ever holds the write lock.
//! 2. Take the write lock and re-load the phase record.
//! 3. Re-check the phase flag. Already set means another caller won;
//!    report `already_awarded` as a success.
//! 4. Re-run the deterministic preconditions on the locked row.
//! 5. Touch the owner's balance row (always after the record row).
//! 6. Flip the flag, append the phase event, commit.
//!
//! Any error before commit rolls back every step.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::models::{Actor, NewLedgerEntry, Phase, PhaseEventRow, PhaseRecordRow, TransactionKind};
use crate::db::phase_records::{self, PhaseCompletion};
use crate::db::{balances, transactions, LedgerDb};
use crate::error::LedgerError;

use super::classifier::ContentClassifier;
use super::events::{EventBus, LedgerEvent};

/// `reason` reported when a phase bonus was already paid
pub const REASON_ALREADY_AWARDED: &str = "already_awarded";

/// `source_type` of phase bonus transactions
pub const PHASE_RECORD_SOURCE: &str = "phase_record";

/// Fixed bonus per phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseBonusTable {
    pub preparation: i64,
    pub reflection: i64,
    pub demonstration: i64,
}

impl PhaseBonusTable {
    pub fn bonus(&self, phase: Phase) -> i64 {
        match phase {
            Phase::Preparation => self.preparation,
            Phase::Reflection => self.reflection,
            Phase::Demonstration => self.demonstration,
        }
    }
}

impl Default for PhaseBonusTable {
    fn default() -> Self {
        Self {
            preparation: 25,
            reflection: 50,
            demonstration: 75,
        }
    }
}

/// Award rules handed to the coordinator at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwardPolicy {
    pub bonuses: PhaseBonusTable,
    /// Minimum trimmed reflection length, in characters
    pub min_reflection_chars: usize,
}

impl AwardPolicy {
    pub fn validate(&self) -> Result<(), LedgerError> {
        for phase in Phase::ALL {
            if self.bonuses.bonus(phase) <= 0 {
                return Err(LedgerError::Config(format!("Bonus for {} must be positive", phase)));
            }
        }
        Ok(())
    }
}

impl Default for AwardPolicy {
    fn default() -> Self {
        Self {
            bonuses: PhaseBonusTable::default(),
            min_reflection_chars: 20,
        }
    }
}

/// Phase-specific submission data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhasePayload {
    Preparation { note: Option<String> },
    Reflection { text: String },
    Demonstration { evidence_ref: String, note: Option<String> },
}

impl PhasePayload {
    pub fn phase(&self) -> Phase {
        match self {
            PhasePayload::Preparation { .. } => Phase::Preparation,
            PhasePayload::Reflection { .. } => Phase::Reflection,
            PhasePayload::Demonstration { .. } => Phase::Demonstration,
        }
    }

    fn audit_note(&self) -> Option<String> {
        match self {
            PhasePayload::Preparation { note } => note.clone(),
            PhasePayload::Reflection { text } => {
                Some(format!("reflection approved ({} chars)", text.trim().chars().count()))
            }
            PhasePayload::Demonstration { evidence_ref, note } => Some(match note {
                Some(note) => format!("{} [{}]", note, evidence_ref.trim()),
                None => format!("evidence {}", evidence_ref.trim()),
            }),
        }
    }
}

/// A request to complete one phase of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSubmission {
    pub record_id: String,
    pub actor: Actor,
    pub payload: PhasePayload,
}

/// Result of an award call. `awarded == false` is still a success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwardOutcome {
    pub awarded: bool,
    pub amount: i64,
    pub new_balance: i64,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

enum Committed {
    Awarded { user_id: String, new_balance: i64 },
    AlreadyAwarded { new_balance: i64 },
}

/// Coordinates phase completion with balance credits
pub struct AwardCoordinator {
    db: Arc<LedgerDb>,
    policy: AwardPolicy,
    classifier: Arc<dyn ContentClassifier>,
    events: Arc<EventBus>,
}

impl AwardCoordinator {
    pub fn new(
        db: Arc<LedgerDb>,
        policy: AwardPolicy,
        classifier: Arc<dyn ContentClassifier>,
        events: Arc<EventBus>,
    ) -> Result<Self, LedgerError> {
        policy.validate()?;
        Ok(Self {
            db,
            policy,
            classifier,
            events,
        })
    }

    pub fn policy(&self) -> &AwardPolicy {
        &self.policy
    }

    // =========================================================================
    // Record lifecycle
    // =========================================================================

    /// Create a not-started record; a fresh id is generated when none is given
    pub fn create_record(&self, owner_id: &str, record_id: Option<&str>) -> Result<PhaseRecordRow, LedgerError> {
        let id = record_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.db
            .with_write_tx(|tx| phase_records::create_record(tx, &id, owner_id))
    }

    pub fn get_record(&self, record_id: &str) -> Result<Option<PhaseRecordRow>, LedgerError> {
        self.db.with_conn(|conn| phase_records::get_record(conn, record_id))
    }

    pub fn phase_events(&self, record_id: &str) -> Result<Vec<PhaseEventRow>, LedgerError> {
        self.db.with_conn(|conn| phase_records::list_phase_events(conn, record_id))
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    pub fn award_preparation(
        &self,
        record_id: &str,
        actor: &Actor,
        note: Option<&str>,
    ) -> Result<AwardOutcome, LedgerError> {
        self.award(&PhaseSubmission {
            record_id: record_id.to_string(),
            actor: actor.clone(),
            payload: PhasePayload::Preparation {
                note: note.map(str::to_string),
            },
        })
    }

    pub fn award_reflection(&self, record_id: &str, actor: &Actor, text: &str) -> Result<AwardOutcome, LedgerError> {
        self.award(&PhaseSubmission {
            record_id: record_id.to_string(),
            actor: actor.clone(),
            payload: PhasePayload::Reflection { text: text.to_string() },
        })
    }

    pub fn award_demonstration(
        &self,
        record_id: &str,
        actor: &Actor,
        evidence_ref: &str,
        note: Option<&str>,
    ) -> Result<AwardOutcome, LedgerError> {
        self.award(&PhaseSubmission {
            record_id: record_id.to_string(),
            actor: actor.clone(),
            payload: PhasePayload::Demonstration {
                evidence_ref: evidence_ref.to_string(),
                note: note.map(str::to_string),
            },
        })
    }

    /// Complete one phase and pay its bonus at most once
    pub fn award(&self, submission: &PhaseSubmission) -> Result<AwardOutcome, LedgerError> {
        let phase = submission.payload.phase();
        let record_id = submission.record_id.as_str();
        let actor = &submission.actor;

        let snapshot = self
            .get_record(record_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("Phase record {}", record_id)))?;

        if snapshot.phase(phase).completed {
            let new_balance = self.current_balance(&snapshot.owner_id)?;
            return Ok(self.already_awarded(submission, new_balance));
        }

        if let Err(e) = self.check_preconditions(&snapshot, actor, &submission.payload) {
            warn!(record_id = %record_id, phase = %phase, actor_id = %actor.id, error = %e, "Phase submission rejected");
            return Err(e);
        }
        self.screen_content(record_id, &submission.payload)?;

        let bonus = self.policy.bonuses.bonus(phase);
        let audit_note = submission.payload.audit_note();

        let committed = self.db.with_write_tx(|tx| {
            let record = phase_records::get_record(tx, record_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("Phase record {}", record_id)))?;

            if record.phase(phase).completed {
                let new_balance = balances::get_balance(tx, &record.owner_id)?
                    .map(|b| b.current_balance)
                    .unwrap_or(0);
                return Ok(Committed::AlreadyAwarded { new_balance });
            }

            self.check_preconditions(&record, actor, &submission.payload)?;

            let entry = transactions::post_entry(
                tx,
                &NewLedgerEntry {
                    user_id: record.owner_id.clone(),
                    kind: TransactionKind::PhaseBonus,
                    amount: bonus,
                    source_id: record.id.clone(),
                    source_type: PHASE_RECORD_SOURCE.to_string(),
                    actor_id: actor.id.clone(),
                    idempotency_key: Some(transactions::phase_bonus_key(&record.id, phase)),
                    note: Some(format!("{} bonus", phase)),
                },
            )?;

            let (reflection_text, evidence_ref) = match &submission.payload {
                PhasePayload::Reflection { text } => (Some(text.trim()), None),
                PhasePayload::Demonstration { evidence_ref, .. } => (None, Some(evidence_ref.trim())),
                PhasePayload::Preparation { .. } => (None, None),
            };

            phase_records::mark_phase_complete(
                tx,
                &record.id,
                &PhaseCompletion {
                    phase,
                    actor_id: &actor.id,
                    bonus,
                    reflection_text,
                    evidence_ref,
                },
            )?;

            phase_records::append_phase_event(tx, &record.id, phase, &actor.id, audit_note.as_deref())?;

            Ok(Committed::Awarded {
                user_id: record.owner_id,
                new_balance: entry.balance_after,
            })
        })?;

        match committed {
            Committed::AlreadyAwarded { new_balance } => Ok(self.already_awarded(submission, new_balance)),
            Committed::Awarded { user_id, new_balance } => {
                info!(
                    record_id = %record_id,
                    phase = %phase,
                    user_id = %user_id,
                    amount = bonus,
                    new_balance,
                    "Phase bonus awarded"
                );
                self.events.emit(LedgerEvent::PhaseAwarded {
                    record_id: record_id.to_string(),
                    phase,
                    user_id,
                    actor_id: actor.id.clone(),
                    amount: bonus,
                    new_balance,
                });
                Ok(AwardOutcome {
                    awarded: true,
                    amount: bonus,
                    new_balance,
                    phase,
                    reason: None,
                })
            }
        }
    }

    // =========================================================================
    // Preconditions
    // =========================================================================

    /// Deterministic checks; safe to run both before and under the lock
    fn check_preconditions(
        &self,
        record: &PhaseRecordRow,
        actor: &Actor,
        payload: &PhasePayload,
    ) -> Result<(), LedgerError> {
        let is_owner = actor.id == record.owner_id;

        match payload {
            PhasePayload::Preparation { .. } | PhasePayload::Demonstration { .. } => {
                if !is_owner && !actor.can_verify() {
                    return Err(LedgerError::Authorization(format!(
                        "{} may not submit phases for record {}",
                        actor.id, record.id
                    )));
                }
            }
            PhasePayload::Reflection { .. } => {
                if is_owner {
                    return Err(LedgerError::Authorization(
                        "Reflection must be approved by someone other than the record owner".into(),
                    ));
                }
                if !actor.can_verify() {
                    return Err(LedgerError::Authorization(format!(
                        "{} does not hold a verifier role",
                        actor.id
                    )));
                }
            }
        }

        match payload {
            PhasePayload::Reflection { text } => {
                let len = text.trim().chars().count();
                if len < self.policy.min_reflection_chars {
                    return Err(LedgerError::Validation(format!(
                        "Reflection must be at least {} characters, got {}",
                        self.policy.min_reflection_chars, len
                    )));
                }
            }
            PhasePayload::Demonstration { evidence_ref, .. } => {
                if evidence_ref.trim().is_empty() {
                    return Err(LedgerError::Validation(
                        "Demonstration requires an evidence reference".into(),
                    ));
                }
            }
            PhasePayload::Preparation { .. } => {}
        }

        Ok(())
    }

    fn screen_content(&self, record_id: &str, payload: &PhasePayload) -> Result<(), LedgerError> {
        if let PhasePayload::Reflection { text } = payload {
            let verdict = self.classifier.classify(text)?;
            if !verdict.approved {
                let reason = verdict.reason.unwrap_or_else(|| "not approved".to_string());
                warn!(record_id = %record_id, reason = %reason, "Reflection rejected by classifier");
                return Err(LedgerError::Validation(format!("Reflection rejected: {}", reason)));
            }
        }
        Ok(())
    }

    fn current_balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        Ok(self
            .db
            .with_conn(|conn| balances::get_balance(conn, user_id))?
            .map(|b| b.current_balance)
            .unwrap_or(0))
    }

    fn already_awarded(&self, submission: &PhaseSubmission, new_balance: i64) -> AwardOutcome {
        let phase = submission.payload.phase();
        debug!(record_id = %submission.record_id, phase = %phase, "Phase already awarded");
        self.events.emit(LedgerEvent::PhaseAlreadyAwarded {
            record_id: submission.record_id.clone(),
            phase,
            actor_id: submission.actor.id.clone(),
        });
        AwardOutcome {
            awarded: false,
            amount: 0,
            new_balance,
            phase,
            reason: Some(REASON_ALREADY_AWARDED.to_string()),
        }
    }
}
