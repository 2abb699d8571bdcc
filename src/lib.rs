//! Kindness Ledger - token balances and phase-progression bonuses
//!
//! Users earn tokens as a Phase Record moves through preparation,
//! reflection and demonstration. Each phase pays a fixed bonus exactly once,
//! however many times (or however concurrently) it is submitted.
//!
//! ## Guarantees
//!
//! | Property | How |
//! |----------|-----|
//! | Exactly-once phase bonus | Flag re-checked under `BEGIN IMMEDIATE` |
//! | No negative balances | Checked before write, `CHECK` constraint in table |
//! | Replayable history | Append-only `transactions`, `balance_before`/`balance_after` chain |
//! | Once-per-user achievements | `(user_id, achievement_id)` primary key |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/kindness-ledger/
//! ├── ledger.db          # SQLite (WAL)
//! └── config.toml        # Configuration
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod services;

// Re-exports
pub use config::Config;
pub use db::models::{Actor, ActorRole, BalanceRow, Phase, PhaseRecordRow, TransactionKind, TransactionRow};
pub use db::{DbStats, LedgerDb};
pub use error::LedgerError;
pub use services::{
    AchievementEvaluator, AwardCoordinator, AwardOutcome, EventBus, LedgerEvent, LedgerService, Services,
};
