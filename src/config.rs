//! Configuration for kindness-ledger

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::DEFAULT_DB_FILE;
use crate::error::LedgerError;
use crate::services::achievements::{default_catalog, AchievementDefinition};
use crate::services::award_coordinator::{AwardPolicy, PhaseBonusTable};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kindness-ledger")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the ledger database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Database file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// How long a writer waits for the database lock before giving up
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Minimum trimmed reflection length, in characters
    #[serde(default = "default_min_reflection_chars")]
    pub min_reflection_chars: usize,

    #[serde(default)]
    pub phase_bonuses: PhaseBonusTable,

    /// Achievement catalog
    #[serde(default = "default_catalog")]
    pub achievements: Vec<AchievementDefinition>,
}

fn default_database_file() -> String {
    DEFAULT_DB_FILE.to_string()
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_min_reflection_chars() -> usize {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            lock_timeout_ms: default_lock_timeout_ms(),
            min_reflection_chars: default_min_reflection_chars(),
            phase_bonuses: PhaseBonusTable::default(),
            achievements: default_catalog(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| LedgerError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LedgerError> {
        let content = toml::to_string_pretty(self).map_err(|e| LedgerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get config file path inside the storage directory
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Award rules for the coordinator
    pub fn award_policy(&self) -> AwardPolicy {
        AwardPolicy {
            bonuses: self.phase_bonuses,
            min_reflection_chars: self.min_reflection_chars,
        }
    }
}
