// Engine configuration.
//
// Global config: `~/.workbench/config.toml`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use workbench_common::module::{ModuleCatalog, ModuleSpec};

/// Root directory for workbench state: `~/.workbench/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".workbench"))
}

/// Path to the global config file: `~/.workbench/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

fn default_database_path() -> PathBuf {
    global_dir().map(|d| d.join("workbench.db")).unwrap_or_else(|| PathBuf::from("workbench.db"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database holding every workflow and its history.
    pub database_path: PathBuf,
    pub retention: RetentionConfig,
    /// Parameter schemas for the modules steps may use.
    pub modules: Vec<ModuleSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { database_path: default_database_path(), retention: RetentionConfig::default(), modules: Vec::new() }
    }
}

impl EngineConfig {
    /// Load from `~/.workbench/config.toml`. A missing file yields defaults;
    /// a malformed one is an error.
    pub fn load() -> Result<Self, ConfigError> {
        match global_config_path() {
            Some(path) => Self::load_or_default(&path),
            None => Ok(Self::default()),
        }
    }

    /// Like [`EngineConfig::load_from`], but a missing file yields defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load_from(path) {
            Err(ConfigError::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            other => other,
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    pub fn catalog(&self) -> ModuleCatalog {
        ModuleCatalog::from_specs(self.modules.iter().cloned())
    }
}

/// How long history entries live once nobody touches them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Entries whose `last_applied_at` is older than this are eligible.
    pub max_age_days: u32,
    /// Seconds between sweeps in `workbench-reaper`.
    pub interval_secs: u64,
    /// Upper bound on workflows visited per sweep.
    pub max_workflows_per_cycle: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { max_age_days: 30, interval_secs: 300, max_workflows_per_cycle: 5000 }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
