use crate::account::AccountLevel;
use crate::catalog::{VersionCatalog, VersionEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MIN_PORT: u16 = 10666;
pub const DEFAULT_MAX_PORT: u16 = 10766;
pub const DEFAULT_MAX_RESTARTS: u32 = 3;
pub const DEFAULT_CLEANUP_INTERVAL_DAYS: u64 = 3;
pub const DEFAULT_CLEANUP_PERIOD_SECS: u64 = 3600;
pub const DEFAULT_QUOTA: u32 = 1;
pub const DEFAULT_PASSWORD_MIN_LENGTH: usize = 5;
pub const DEFAULT_REPUTATION_ENDPOINT: &str = "http://check.getipintel.net/check.php";

fn default_min_port() -> u16 {
    DEFAULT_MIN_PORT
}

fn default_max_port() -> u16 {
    DEFAULT_MAX_PORT
}

fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}

fn default_cleanup_interval_days() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_DAYS
}

fn default_cleanup_period_secs() -> u64 {
    DEFAULT_CLEANUP_PERIOD_SECS
}

fn default_quota() -> u32 {
    DEFAULT_QUOTA
}

fn default_password_min_length() -> usize {
    DEFAULT_PASSWORD_MIN_LENGTH
}

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    DEFAULT_REPUTATION_ENDPOINT.to_string()
}

fn default_minimum() -> f64 {
    0.995
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What the launch builder does with a gamemode outside the alias table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownGamemode {
    #[default]
    Reject,
    Cooperative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSettings {
    #[serde(default = "default_min_port")]
    pub min_port: u16,
    #[serde(default = "default_max_port")]
    pub max_port: u16,
    pub wad_dir: PathBuf,
    pub iwad_dir: PathBuf,
    pub config_dir: PathBuf,
    pub banlist_dir: PathBuf,
    pub whitelist_dir: PathBuf,
    pub adminlist_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub hostname_base: String,
    /// Content wads appended to every instance's wad list.
    #[serde(default)]
    pub extra_wads: Vec<String>,
    /// Names that resolve against `iwad_dir` when passed to `-file`.
    #[serde(default)]
    pub iwads: Vec<String>,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_cleanup_interval_days")]
    pub cleanup_interval_days: u64,
    #[serde(default = "default_cleanup_period_secs")]
    pub cleanup_period_secs: u64,
    #[serde(default = "default_quota")]
    pub default_quota: u32,
    #[serde(default = "default_true")]
    pub strict_options: bool,
    #[serde(default)]
    pub unknown_gamemode: UnknownGamemode,
    /// Generate "<owner>'s server" when a request omits `hostname`.
    #[serde(default)]
    pub hostname_fallback: bool,
    #[serde(default)]
    pub game_address: String,
    #[serde(default = "default_password_min_length")]
    pub password_min_length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSettings {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub short: String,
    #[serde(default)]
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReputationSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default = "default_minimum")]
    pub minimum: f64,
}

impl Default for ReputationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            contact: String::new(),
            minimum: default_minimum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BanEntry {
    pub ip: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlacklistEntry {
    pub name: String,
    /// Hex SHA-256 of the file contents.
    pub hash: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySettings {
    #[serde(default)]
    pub quotas: HashMap<String, u32>,
    #[serde(default)]
    pub levels: HashMap<String, AccountLevel>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub bans: Vec<BanEntry>,
    #[serde(default)]
    pub blacklist: Vec<BlacklistEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: HostSettings,
    pub service: ServiceSettings,
    pub reputation: ReputationSettings,
    pub policy: PolicySettings,
    pub catalog: VersionCatalog,
}

impl Config {
    /// Directory instance logs are written to, falling back to `default`.
    pub fn log_dir_or(&self, default: &Path) -> PathBuf {
        self.host
            .log_dir
            .clone()
            .unwrap_or_else(|| default.to_path_buf())
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    host: HostSettings,
    #[serde(default)]
    service: ServiceSettings,
    #[serde(default)]
    reputation: ReputationSettings,
    #[serde(default)]
    policy: PolicySettings,
    #[serde(default)]
    versions: Vec<VersionEntry>,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config file is empty")]
    Empty,
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("unknown section `{0}`")]
    UnknownSection(String),
    #[error("invalid port range {min}..{max}")]
    InvalidPortRange { min: u16, max: u16 },
    #[error("reputation minimum must be within 0.0..=1.0, got {0}")]
    InvalidMinimum(f64),
    #[error("version catalog: {0}")]
    Catalog(String),
    #[error("{0}")]
    IoError(String),
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Err(ConfigError::Empty);
    }

    let raw: RawConfig = toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;

    if let Some(section) = raw.extra.keys().min() {
        return Err(ConfigError::UnknownSection(section.clone()));
    }

    if raw.host.min_port == 0 || raw.host.min_port >= raw.host.max_port {
        return Err(ConfigError::InvalidPortRange {
            min: raw.host.min_port,
            max: raw.host.max_port,
        });
    }

    if !(0.0..=1.0).contains(&raw.reputation.minimum) {
        return Err(ConfigError::InvalidMinimum(raw.reputation.minimum));
    }

    let catalog = VersionCatalog::new(raw.versions)?;

    Ok(Config {
        host: raw.host,
        service: raw.service,
        reputation: raw.reputation,
        policy: raw.policy,
        catalog,
    })
}
