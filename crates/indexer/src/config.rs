//! Configuration management for the Unirep synchronizer.
//!
//! This module handles loading configuration from:
//! - TOML files
//! - Environment variables referenced as `${VAR_NAME}`
//! - Default values (fallbacks)

use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use unisync_core::AttesterId;

/// Main configuration for the synchronizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration
    pub network: NetworkConfig,

    /// Contract addresses
    pub contracts: ContractsConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Sync configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Paginated-query adapter (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgraph: Option<SubgraphConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Ethereum RPC URL
    pub rpc_url: String,

    /// Chain ID (e.g., 11155111 for Sepolia)
    pub chain_id: u64,
}

/// Contract addresses configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractsConfig {
    /// Unirep contract address
    pub unirep: Address,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://unirep.db"); in-memory when omitted
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

/// Which attesters a synchronizer tracks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttesterSelection {
    /// Every attester ever registered, discovered as registrations appear
    #[default]
    All,

    /// A fixed set; the first entry is the default attester
    Only(Vec<AttesterId>),
}

impl AttesterSelection {
    /// Whether this selection tracks every attester.
    pub fn is_all(&self) -> bool {
        matches!(self, AttesterSelection::All)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(u64),
    Str(String),
}

impl RawId {
    fn into_id(self) -> std::result::Result<AttesterId, String> {
        match self {
            RawId::Num(n) => Ok(AttesterId::from(n)),
            RawId::Str(s) => s.parse().map_err(|e| format!("{}", e)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSelection {
    One(RawId),
    Many(Vec<RawId>),
}

impl<'de> Deserialize<'de> for AttesterSelection {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawSelection::deserialize(deserializer)?;
        let ids = match raw {
            RawSelection::One(RawId::Str(s)) if s.eq_ignore_ascii_case("all") => {
                return Ok(AttesterSelection::All)
            }
            RawSelection::One(id) => vec![id],
            RawSelection::Many(ids) => ids,
        };
        ids.into_iter()
            .map(RawId::into_id)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(AttesterSelection::Only)
            .map_err(serde::de::Error::custom)
    }
}

impl Serialize for AttesterSelection {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            AttesterSelection::All => serializer.serialize_str("all"),
            AttesterSelection::Only(ids) => ids.serialize(serializer),
        }
    }
}

/// Sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attesters to synchronize: "all", one id, or a list of ids
    #[serde(default)]
    pub attesters: AttesterSelection,

    /// Lowest block searched for attester registrations
    #[serde(default)]
    pub start_block: u64,

    /// Steady-state polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Blocks per concurrent sub-range fetch
    #[serde(default = "default_block_rate")]
    pub block_rate: u64,

    /// Sub-ranges loaded per poll
    #[serde(default = "default_max_chunks_per_poll")]
    pub max_chunks_per_poll: u64,

    /// Backoff floor in milliseconds
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Consistency-barrier polling interval in milliseconds
    #[serde(default = "default_wait_interval_ms")]
    pub wait_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            attesters: AttesterSelection::default(),
            start_block: 0,
            poll_interval_ms: default_poll_interval_ms(),
            block_rate: default_block_rate(),
            max_chunks_per_poll: default_max_chunks_per_poll(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            wait_interval_ms: default_wait_interval_ms(),
        }
    }
}

impl SyncConfig {
    /// Runtime options for a synchronizer.
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            attesters: self.attesters.clone(),
            start_block: self.start_block,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            block_rate: self.block_rate,
            max_chunks_per_poll: self.max_chunks_per_poll,
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            wait_interval: Duration::from_millis(self.wait_interval_ms),
        }
    }
}

/// Runtime options derived from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Attesters to synchronize
    pub attesters: AttesterSelection,
    /// Lowest block searched for attester registrations
    pub start_block: u64,
    /// Steady-state poll rate
    pub poll_interval: Duration,
    /// Blocks per sub-range fetch
    pub block_rate: u64,
    /// Sub-ranges loaded per poll
    pub max_chunks_per_poll: u64,
    /// Backoff floor
    pub min_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Consistency-barrier polling interval
    pub wait_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncConfig::default().options()
    }
}

/// Paginated-query adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphConfig {
    /// GraphQL endpoint
    pub url: String,

    /// Page size (`first`)
    #[serde(default = "default_query_count")]
    pub query_count: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_block_rate() -> u64 {
    10000
}

fn default_max_chunks_per_poll() -> u64 {
    10
}

fn default_min_backoff_ms() -> u64 {
    128
}

fn default_max_backoff_ms() -> u64 {
    16384
}

fn default_wait_interval_ms() -> u64 {
    250
}

fn default_query_count() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables can be referenced using `${VAR_NAME}` syntax.
    /// For example: `rpc_url = "${UNIREP_RPC_URL}"`
    ///
    /// # Example
    /// ```no_run
    /// # use unisync_indexer::config::Config;
    /// let config = Config::from_file("unisync.toml")?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let expanded = expand_env_vars(&contents)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml).context("Failed to parse TOML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.network.rpc_url.is_empty() {
            anyhow::bail!("Network RPC URL cannot be empty");
        }
        if self.network.chain_id == 0 {
            anyhow::bail!("Chain ID must be non-zero");
        }

        if self.contracts.unirep.is_zero() {
            anyhow::bail!("Contracts unirep must be a non-zero address");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be > 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        let sync = &self.sync;
        if let AttesterSelection::Only(ids) = &sync.attesters {
            if ids.is_empty() {
                anyhow::bail!("Sync attesters list cannot be empty (use \"all\" to track every attester)");
            }
        }
        if sync.poll_interval_ms == 0 {
            anyhow::bail!("Sync poll_interval_ms must be > 0");
        }
        if sync.block_rate == 0 {
            anyhow::bail!("Sync block_rate must be > 0");
        }
        if sync.max_chunks_per_poll == 0 {
            anyhow::bail!("Sync max_chunks_per_poll must be > 0");
        }
        if sync.min_backoff_ms == 0 {
            anyhow::bail!("Sync min_backoff_ms must be > 0");
        }
        if sync.max_backoff_ms < sync.min_backoff_ms {
            anyhow::bail!(
                "Sync max_backoff_ms ({}) cannot be below min_backoff_ms ({})",
                sync.max_backoff_ms,
                sync.min_backoff_ms
            );
        }
        if sync.wait_interval_ms == 0 {
            anyhow::bail!("Sync wait_interval_ms must be > 0");
        }

        if let Some(subgraph) = &self.subgraph {
            if subgraph.url.trim().is_empty() {
                anyhow::bail!("Subgraph url cannot be empty");
            }
            if subgraph.query_count == 0 {
                anyhow::bail!("Subgraph query_count must be > 0");
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Logging level must be one of: {} (got '{}')",
                valid_levels.join(", "),
                self.logging.level
            );
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!(
                "Logging format must be one of: {} (got '{}')",
                valid_formats.join(", "),
                self.logging.format
            );
        }

        Ok(())
    }
}

/// Expand `${VAR_NAME}` placeholders, leaving `#` comments untouched.
///
/// Returns an error if a referenced variable is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());

    for (line_no, line) in input.split_inclusive('\n').enumerate() {
        let (body, comment) = split_comment(line);
        let mut rest = body;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').with_context(|| {
                format!("Unterminated environment variable on line {}", line_no + 1)
            })?;
            let name = &after[..end];
            let value = std::env::var(name).with_context(|| {
                format!(
                    "Environment variable '{}' referenced on line {} is not set",
                    name,
                    line_no + 1
                )
            })?;
            out.push_str(&value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out.push_str(comment);
    }

    Ok(out)
}

/// Split a TOML line at the first `#` outside a string.
fn split_comment(line: &str) -> (&str, &str) {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, ch) {
            (Some('"'), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '"') | (None, '\'') => quote = Some(ch),
            (None, '#') => return (&line[..i], &line[i..]),
            _ => {}
        }
    }
    (line, "")
}
