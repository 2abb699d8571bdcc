//! Service layer for kindness-ledger
//!
//! Services wrap the db modules with:
//! - Precondition and authorization checks
//! - Transaction boundaries (one write transaction per award or unlock)
//! - Event emission after commit
//!
//! ## Architecture
//!
//! ```text
//! Callers (CLI, request handlers, workers)
//!     ↓
//! Service Layer (award coordinator, achievements, ledger service)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod achievements;
pub mod award_coordinator;
pub mod classifier;
pub mod events;
pub mod ledger_service;

// Re-exports
pub use achievements::{
    default_catalog, spawn_achievement_listener, AchievementDefinition, AchievementEvaluator,
    AchievementRequirement, UnlockResult,
};
pub use award_coordinator::{
    AwardCoordinator, AwardOutcome, AwardPolicy, PhaseBonusTable, PhasePayload, PhaseSubmission,
    REASON_ALREADY_AWARDED,
};
pub use classifier::{ApproveAll, Classification, ContentClassifier, MinimumWordsClassifier};
pub use events::{spawn_listener, spawn_logging_listener, EventBus, EventListener, LedgerEvent};
pub use ledger_service::{LedgerService, NewAdjustment, ReconciliationReport};

use crate::config::Config;
use crate::db::LedgerDb;
use crate::error::LedgerError;
use std::sync::Arc;

/// Service container for dependency injection
///
/// All services share one database handle and one event bus.
pub struct Services {
    pub awards: Arc<AwardCoordinator>,
    pub achievements: Arc<AchievementEvaluator>,
    pub ledger: Arc<LedgerService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services from configuration
    pub fn new(
        db: Arc<LedgerDb>,
        config: &Config,
        classifier: Arc<dyn ContentClassifier>,
    ) -> Result<Self, LedgerError> {
        let events = Arc::new(EventBus::new());

        Ok(Self {
            awards: Arc::new(AwardCoordinator::new(
                db.clone(),
                config.award_policy(),
                classifier,
                events.clone(),
            )?),
            achievements: Arc::new(AchievementEvaluator::new(
                db.clone(),
                config.achievements.clone(),
                events.clone(),
            )?),
            ledger: Arc::new(LedgerService::new(db, events.clone())),
            events,
        })
    }
}
