//! Node configuration: a JSON file in the data directory, overridden by
//! command-line flags.

use std::path::{Path, PathBuf};

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::core::params::NetworkParams;
use crate::core::validator::ValidatorFlags;
use crate::storage::DatabaseConfig;

pub const CONFIG_FILE: &str = "bitforge.json";
pub const DEFAULT_DATA_DIR: &str = "bitforge_data";

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    UnknownNetwork(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config io error: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid {}: {}", CONFIG_FILE, e),
            ConfigError::UnknownNetwork(n) => write!(f, "unknown network '{}'", n),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `main` or `regtest`
    pub network: String,
    /// Minimum time between disk commits
    pub commit_gap_ms: u64,
    /// Staged bytes that force a commit regardless of the gap
    pub cache_limit: usize,
    pub check_pow: bool,
    pub full_validation: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let db = DatabaseConfig::default();
        NodeConfig {
            network: "main".into(),
            commit_gap_ms: db.commit_gap_ms,
            cache_limit: db.cache_limit,
            check_pow: true,
            full_validation: true,
        }
    }
}

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// Network: main or regtest
    #[arg(long, global = true)]
    pub network: Option<String>,
    /// Milliseconds between disk commits
    #[arg(long, global = true)]
    pub commit_gap_ms: Option<u64>,
    /// Staged bytes that force a commit
    #[arg(long, global = true)]
    pub cache_limit: Option<usize>,
    /// Skip proof-of-work checks (trusted imports only)
    #[arg(long, global = true)]
    pub no_pow: bool,
}

impl ConfigArgs {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    /// Settings from the config file with these flags applied on top.
    pub fn resolve(&self) -> Result<NodeConfig, ConfigError> {
        let mut config = NodeConfig::load(&self.data_dir())?;
        if let Some(network) = &self.network {
            config.network = network.clone();
        }
        if let Some(gap) = self.commit_gap_ms {
            config.commit_gap_ms = gap;
        }
        if let Some(limit) = self.cache_limit {
            config.cache_limit = limit;
        }
        if self.no_pow {
            config.check_pow = false;
        }
        config.params()?;
        Ok(config)
    }
}

impl NodeConfig {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    /// Read the config file, falling back to defaults when there is none.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(data_dir);
        if !path.exists() {
            return Ok(NodeConfig::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(data_dir)?;
        std::fs::write(Self::path(data_dir), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn params(&self) -> Result<NetworkParams, ConfigError> {
        NetworkParams::by_name(&self.network).ok_or_else(|| ConfigError::UnknownNetwork(self.network.clone()))
    }

    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig { commit_gap_ms: self.commit_gap_ms, cache_limit: self.cache_limit, ..DatabaseConfig::default() }
    }

    pub fn validator_flags(&self) -> ValidatorFlags {
        ValidatorFlags { check_pow: self.check_pow, full_validation: self.full_validation }
    }
}
