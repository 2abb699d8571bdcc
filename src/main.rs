//! Kindness Ledger CLI
//!
//! Operator tool for the token ledger database.
//!
//! ## Usage
//!
//! ```bash
//! # Create the database and a default config
//! kindness-ledger init
//!
//! # Inspect a user
//! kindness-ledger balance u1
//! kindness-ledger history u1
//!
//! # Check cached balances against the transaction log
//! kindness-ledger reconcile
//! kindness-ledger reconcile --user u1
//!
//! # Unlock any achievements a user now qualifies for
//! kindness-ledger evaluate u1
//!
//! # Drive a phase record by hand
//! kindness-ledger create-record u1 --record-id r1
//! kindness-ledger award r1 preparation --actor u1
//! kindness-ledger award r1 reflection --actor t1 --role verifier --text "..."
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use kindness_ledger::services::{spawn_logging_listener, ApproveAll, PhasePayload, PhaseSubmission, Services};
use kindness_ledger::{Actor, ActorRole, Config, LedgerDb, Phase};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kindness-ledger")]
#[command(about = "Token ledger and phase bonus engine")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "KINDNESS_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "KINDNESS_LEDGER_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Lock wait bound in milliseconds
    #[arg(long)]
    lock_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and write a default config if missing
    Init,
    /// Show a user's balance
    Balance { user_id: String },
    /// Show a user's transaction log
    History { user_id: String },
    /// Compare cached balances with a replay of the log
    Reconcile {
        #[arg(long)]
        user: Option<String>,
    },
    /// Evaluate achievements for a user
    Evaluate { user_id: String },
    /// Create a phase record
    CreateRecord {
        owner_id: String,
        #[arg(long)]
        record_id: Option<String>,
    },
    /// Complete one phase of a record
    Award {
        record_id: String,
        #[arg(value_enum)]
        phase: PhaseArg,
        #[arg(long)]
        actor: String,
        #[arg(long, value_enum, default_value = "owner")]
        role: RoleArg,
        /// Reflection text
        #[arg(long)]
        text: Option<String>,
        /// Demonstration evidence reference
        #[arg(long)]
        evidence: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PhaseArg {
    Preparation,
    Reflection,
    Demonstration,
}

impl From<PhaseArg> for Phase {
    fn from(arg: PhaseArg) -> Self {
        match arg {
            PhaseArg::Preparation => Phase::Preparation,
            PhaseArg::Reflection => Phase::Reflection,
            PhaseArg::Demonstration => Phase::Demonstration,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RoleArg {
    Owner,
    Verifier,
    Admin,
}

impl From<RoleArg> for ActorRole {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Owner => ActorRole::Owner,
            RoleArg::Verifier => ActorRole::Verifier,
            RoleArg::Admin => ActorRole::Admin,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("kindness_ledger=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("loading config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(ms) = args.lock_timeout_ms {
        config.lock_timeout_ms = ms;
    }

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .context("creating storage directory")?;

    let db = Arc::new(
        LedgerDb::open_at(config.database_path(), config.lock_timeout()).context("opening ledger database")?,
    );
    let services = Services::new(db.clone(), &config, Arc::new(ApproveAll))?;
    let audit_log = spawn_logging_listener(&services.events);

    match args.command {
        Command::Init => {
            let config_path = config.config_path();
            if !config_path.exists() {
                config.save(&config_path)?;
                info!(path = %config_path.display(), "Created default config");
            }
            print_json(&db.stats()?)?;
        }
        Command::Balance { user_id } => {
            print_json(&services.ledger.get_balance(&user_id)?)?;
        }
        Command::History { user_id } => {
            print_json(&services.ledger.history(&user_id)?)?;
        }
        Command::Reconcile { user } => {
            let reports = match user {
                Some(user_id) => vec![services.ledger.reconcile(&user_id)?],
                None => services.ledger.reconcile_all()?,
            };
            let mismatched = reports.iter().filter(|r| !r.consistent).count();
            print_json(&reports)?;
            if mismatched > 0 {
                warn!(mismatched, "Reconciliation found inconsistent balances");
                std::process::exit(2);
            }
            info!(users = reports.len(), "All balances reconcile");
        }
        Command::Evaluate { user_id } => {
            print_json(&services.achievements.evaluate(&user_id)?)?;
        }
        Command::CreateRecord { owner_id, record_id } => {
            print_json(&services.awards.create_record(&owner_id, record_id.as_deref())?)?;
        }
        Command::Award {
            record_id,
            phase,
            actor,
            role,
            text,
            evidence,
            note,
        } => {
            let payload = match Phase::from(phase) {
                Phase::Preparation => PhasePayload::Preparation { note },
                Phase::Reflection => PhasePayload::Reflection {
                    text: text.unwrap_or_default(),
                },
                Phase::Demonstration => PhasePayload::Demonstration {
                    evidence_ref: evidence.unwrap_or_default(),
                    note,
                },
            };
            let outcome = services.awards.award(&PhaseSubmission {
                record_id,
                actor: Actor::new(actor, role.into()),
                payload,
            })?;
            print_json(&outcome)?;
        }
    }

    // Dropping the services closes the bus; the audit listener drains and exits
    drop(services);
    if let Err(e) = audit_log.await {
        warn!(error = %e, "Audit log listener failed");
    }

    Ok(())
}
