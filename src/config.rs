/// Service configuration.
///
/// Loaded from a TOML file (every section and key optional), then overlaid
/// with `BUOY_*` environment variables so credentials can live in `.env`
/// instead of the checked-in file:
///
/// ```toml
/// [feed]
/// url = "https://www.ndbc.noaa.gov/data/latest_obs/latest_obs.txt"
/// timeout_secs = 30
///
/// [database]
/// host = "localhost"
/// port = 5432
/// user = "buoy"
/// dbname = "buoy_data"
///
/// [retry]
/// max_attempts = 3
/// initial_delay_secs = 3.0
/// backoff_multiplier = 2.0
///
/// [logging]
/// level = "info"
/// file = "buoy_ingest.log"
/// timestamps = true
///
/// [pipeline]
/// skip_malformed_rows = false
/// retry_storage = false
/// ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::ingest::ndbc::NDBC_LATEST_OBS_URL;
use crate::logging::LogLevel;
use crate::model::BuoyError;
use crate::retry::{RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_ATTEMPTS};

pub const DEFAULT_CONFIG_PATH: &str = "buoy_ingest.toml";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            url: NDBC_LATEST_OBS_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

impl FeedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            dbname: "buoy_data".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Connection parameters for the Postgres backend. Credentials are set
    /// field by field, never formatted into a connection string.
    pub fn connection_params(&self) -> postgres::Config {
        let mut params = postgres::Config::new();
        params
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname);
        if !self.password.is_empty() {
            params.password(&self.password);
        }
        params
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_secs: f64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_secs: 3.0,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs_f64(self.initial_delay_secs),
            self.backoff_multiplier,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
            timestamps: true,
        }
    }
}

impl LoggingConfig {
    pub fn min_level(&self) -> Result<LogLevel, BuoyError> {
        LogLevel::from_name(&self.level)
            .ok_or_else(|| BuoyError::Config(format!("unknown log level '{}'", self.level)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Map rows one by one and drop the ones that fail, instead of aborting.
    pub skip_malformed_rows: bool,
    /// Put every storage round trip under the retry policy.
    pub retry_storage: bool,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    pub fn from_toml_str(text: &str, path: &str) -> Result<Config, BuoyError> {
        toml::from_str(text).map_err(|source| BuoyError::ConfigParse {
            path: path.to_string(),
            source,
        })
    }

    /// Load `path` if it exists (defaults otherwise), apply `.env` and
    /// process environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Config, BuoyError> {
        dotenv::dotenv().ok();

        let display = path.display().to_string();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| BuoyError::ConfigRead {
                path: display.clone(),
                source,
            })?;
            Config::from_toml_str(&text, &display)?
        } else {
            Config::default()
        };

        let env: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("BUOY_"))
            .collect();
        config.apply_overrides(&env)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `BUOY_*` variables onto the loaded values.
    pub fn apply_overrides(&mut self, env: &HashMap<String, String>) -> Result<(), BuoyError> {
        if let Some(url) = env.get("BUOY_FEED_URL") {
            self.feed.url = url.clone();
        }
        if let Some(host) = env.get("BUOY_DB_HOST") {
            self.database.host = host.clone();
        }
        if let Some(port) = env.get("BUOY_DB_PORT") {
            self.database.port = port
                .parse()
                .map_err(|_| BuoyError::Config(format!("BUOY_DB_PORT '{}' is not a port", port)))?;
        }
        if let Some(user) = env.get("BUOY_DB_USER") {
            self.database.user = user.clone();
        }
        if let Some(password) = env.get("BUOY_DB_PASSWORD") {
            self.database.password = password.clone();
        }
        if let Some(dbname) = env.get("BUOY_DB_NAME") {
            self.database.dbname = dbname.clone();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BuoyError> {
        if self.feed.url.trim().is_empty() {
            return Err(BuoyError::Config("feed.url is empty".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(BuoyError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if !self.retry.initial_delay_secs.is_finite() || self.retry.initial_delay_secs < 0.0 {
            return Err(BuoyError::Config(
                "retry.initial_delay_secs must be a non-negative number".to_string(),
            ));
        }
        if !(self.retry.backoff_multiplier >= 1.0) || !self.retry.backoff_multiplier.is_finite() {
            return Err(BuoyError::Config("retry.backoff_multiplier must be >= 1".to_string()));
        }
        self.logging.min_level()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
