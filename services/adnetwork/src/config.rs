//! Configuration for the ad network service.
//!
//! Keys are dotted paths (`input.service.port`, `bids.output.file`, ...).
//! Sources, later overriding earlier:
//! 1. Built-in defaults
//! 2. `config/adnetwork.{toml,yaml,json}` and `/etc/adnetwork/adnetwork`
//! 3. Environment variables prefixed with `ADNETWORK`, `__` as separator
//!    (e.g. `ADNETWORK__WRITE__TO__HBASE=true`)
//! 4. Runtime arguments of the form `key=value`

use crate::auction::{AdvertiserCatalog, CatalogError};
use crate::bid::AdvertiserCategory;
use config::{Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the ad network service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service-level settings
    #[serde(default)]
    pub service: ServiceConfig,
    /// Ingestion endpoint (`input.service.*`)
    #[serde(default)]
    pub input: InputConfig,
    /// File sink (`bids.output.file`)
    #[serde(default)]
    pub bids: BidsConfig,
    /// Table sink switch (`write.to.hbase`)
    #[serde(default)]
    pub write: WriteConfig,
    /// Table store connection file (`hbase.conf.path`)
    #[serde(default)]
    pub hbase: HbaseConfig,
    /// Tick driver
    #[serde(default)]
    pub poller: PollerConfig,
    /// Base bid per advertiser
    #[serde(default)]
    pub advertisers: AdvertisersConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port, 0 disables the exporter
    #[serde(default)]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputConfig {
    #[serde(default)]
    pub service: InputServiceConfig,
}

/// Ingestion endpoint listener
#[derive(Debug, Clone, Deserialize)]
pub struct InputServiceConfig {
    /// Listen address
    #[serde(default = "default_input_host")]
    pub host: String,
    /// Listen port, 0 selects an ephemeral port
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BidsConfig {
    #[serde(default)]
    pub output: BidsOutputConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BidsOutputConfig {
    /// Append bids to this file
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WriteConfig {
    #[serde(default)]
    pub to: WriteToConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WriteToConfig {
    /// Write bids to the transactional table
    #[serde(default)]
    pub hbase: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HbaseConfig {
    #[serde(default)]
    pub conf: HbaseConfConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HbaseConfConfig {
    /// Path to the table store connection file
    pub path: Option<PathBuf>,
}

/// Where the poller reads batches from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollSource {
    /// Drain the in-process queue directly
    #[default]
    Local,
    /// Call `GET /id` on the ingestion endpoint
    Http,
}

/// Tick driver configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Tick period in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Batch source
    #[serde(default)]
    pub source: PollSource,
    /// Read timeout for HTTP polls in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// Base bid amounts
#[derive(Debug, Clone, Deserialize)]
pub struct AdvertisersConfig {
    #[serde(default = "default_music_amount")]
    pub music: f64,
    #[serde(default = "default_travel_amount")]
    pub travel: f64,
}

/// Connection settings read from the file at `hbase.conf.path`
#[derive(Debug, Clone, Deserialize)]
pub struct TableStoreConfig {
    /// SQLite connection URL
    pub url: String,
    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Create the database file when missing
    #[serde(default = "default_true")]
    pub create_if_missing: bool,
}

/// The persistence strategy chosen at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkSelection {
    File { path: PathBuf },
    Table { conf_path: PathBuf },
}

// Default value functions
fn default_service_name() -> String {
    "adnetwork".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_input_host() -> String {
    "0.0.0.0".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_read_timeout_ms() -> u64 {
    2000
}

fn default_music_amount() -> f64 {
    15.0
}

fn default_travel_amount() -> f64 {
    12.0
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: 0,
        }
    }
}

impl Default for InputServiceConfig {
    fn default() -> Self {
        Self {
            host: default_input_host(),
            port: 0,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            source: PollSource::default(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for AdvertisersConfig {
    fn default() -> Self {
        Self {
            music: default_music_amount(),
            travel: default_travel_amount(),
        }
    }
}

impl Config {
    /// Load configuration from files, environment and process arguments
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with_args(std::env::args().skip(1))
    }

    /// Load configuration, applying `key=value` runtime arguments last
    pub fn load_with_args<I, S>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = config::Config::builder()
            // Add config file if present
            .add_source(File::with_name("config/adnetwork").required(false))
            .add_source(File::with_name("/etc/adnetwork/adnetwork").required(false))
            // ADNETWORK__INPUT__SERVICE__PORT -> input.service.port
            .add_source(
                Environment::with_prefix("ADNETWORK")
                    .separator("__")
                    .try_parsing(true),
            );

        for (key, value) in parse_runtime_args(args)? {
            builder = builder.set_override(key, value)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Build configuration from runtime arguments only
    pub fn from_args<I, S>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = config::Config::builder();
        for (key, value) in parse_runtime_args(args)? {
            builder = builder.set_override(key, value)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.sink()?;
        self.catalog()?;

        if !matches!(self.service.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigValidationError::InvalidValue {
                field: "service.log_format".to_string(),
                message: format!("Expected json or pretty, got {}", self.service.log_format),
            });
        }

        if self.poller.interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "poller.interval_ms".to_string(),
                message: "Tick period must be greater than 0".to_string(),
            });
        }

        if self.poller.source == PollSource::Http && self.poller.read_timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "poller.read_timeout_ms".to_string(),
                message: "Read timeout must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Resolve which sink the service writes to
    pub fn sink(&self) -> Result<SinkSelection, ConfigValidationError> {
        let file = self.bids.output.file.as_ref();

        if self.write.to.hbase {
            if file.is_some() {
                return Err(ConfigValidationError::Conflict(
                    "bids.output.file and write.to.hbase are mutually exclusive".to_string(),
                ));
            }
            let conf_path = self
                .hbase
                .conf
                .path
                .clone()
                .ok_or_else(|| ConfigValidationError::MissingField("hbase.conf.path".to_string()))?;
            return Ok(SinkSelection::Table { conf_path });
        }

        match file {
            Some(path) if !path.as_os_str().is_empty() => {
                Ok(SinkSelection::File { path: path.clone() })
            }
            Some(_) => Err(ConfigValidationError::InvalidValue {
                field: "bids.output.file".to_string(),
                message: "Path must not be empty".to_string(),
            }),
            None => Err(ConfigValidationError::MissingField(
                "bids.output.file or write.to.hbase".to_string(),
            )),
        }
    }

    /// Advertiser catalog built from the configured base amounts
    pub fn catalog(&self) -> Result<AdvertiserCatalog, ConfigValidationError> {
        AdvertiserCatalog::new([
            (AdvertiserCategory::Music, self.advertisers.music),
            (AdvertiserCategory::Travel, self.advertisers.travel),
        ])
        .map_err(ConfigValidationError::from)
    }
}

impl PollerConfig {
    /// Get tick period as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Get HTTP read timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl TableStoreConfig {
    /// Load the connection file (TOML)
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(File::new(&path.to_string_lossy(), FileFormat::Toml).required(true))
            .build()?
            .try_deserialize()
    }

    /// Connection settings for a database file
    pub fn for_path(path: &Path) -> Self {
        Self {
            url: format!("sqlite://{}", path.display()),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            create_if_missing: true,
        }
    }
}

/// Split `key=value` runtime arguments
fn parse_runtime_args<I, S>(args: I) -> Result<Vec<(String, String)>, ConfigValidationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|arg| {
            let arg = arg.as_ref();
            match arg.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Ok((key.trim().to_string(), value.to_string()))
                }
                _ => Err(ConfigValidationError::InvalidArgument(arg.to_string())),
            }
        })
        .collect()
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Conflicting settings: {0}")]
    Conflict(String),

    #[error("Runtime argument must look like key=value, got {0:?}")]
    InvalidArgument(String),

    #[error("Invalid advertiser catalog: {0}")]
    Catalog(#[from] CatalogError),
}
