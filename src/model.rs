/// Core data types for the buoy ingestion service.
///
/// This module defines the shared domain model imported by all other modules:
/// the raw feed row, the typed observation, and the crate error type.
/// It contains no I/O.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Feed constants
// ---------------------------------------------------------------------------

/// Literal token the NDBC feed uses for "not measured".
pub const MISSING_SENTINEL: &str = "MM";

/// Format of the derived `Timestamp` field and the stored `timestamp` column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Watermark used for a station with no stored rows.
///
/// Observation timestamps are limited to four-digit years, so every one of
/// them is strictly later than this.
pub const WATERMARK_EPOCH: NaiveDateTime = NaiveDateTime::MIN;

/// Years a `YYYY` feed token can express.
pub const MIN_OBSERVATION_YEAR: i32 = 0;
pub const MAX_OBSERVATION_YEAR: i32 = 9999;

/// Column names of the derived fields added by the feed parser.
pub const FIELD_STATION: &str = "#STN";
pub const FIELD_TIMESTAMP: &str = "Timestamp";
pub const FIELD_LOCATION: &str = "Location";

// ---------------------------------------------------------------------------
// Raw rows
// ---------------------------------------------------------------------------

/// One data line of the feed, keyed by header column name.
///
/// After parsing, the date/time and position columns have been folded into
/// `Timestamp` and `Location`; everything else is the feed's raw token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    fields: BTreeMap<String, String>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = RawRow::new();
        for (name, value) in iter {
            row.insert(name, value);
        }
        row
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// A single typed buoy observation, ready for storage.
///
/// `station`, `timestamp` and `location` are always present. Every
/// measurement is independently optional; `None` means the buoy reported
/// the `MM` sentinel for that column.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub station: String,
    pub timestamp: String, // "YYYY-MM-DD HH:MM:SS"
    pub location: String,  // "LAT,LON"
    pub wind_direction: Option<i32>,     // WDIR, degT
    pub wind_speed: Option<f64>,         // WSPD, m/s
    pub gust_speed: Option<f64>,         // GST, m/s
    pub wave_height: Option<f64>,        // WVHT, m
    pub dom_wave_period: Option<f64>,    // DPD, sec
    pub avg_wave_period: Option<f64>,    // APD, sec
    pub dom_wave_direction: Option<i32>, // MWD, degT
    pub sea_pressure: Option<f64>,       // PRES, hPa
    pub air_temp: Option<f64>,           // ATMP, degC
    pub sea_surface_temp: Option<f64>,   // WTMP, degC
    pub dewpoint_temp: Option<f64>,      // DEWP, degC
    pub visibility: Option<f64>,         // VIS, nmi
    pub pressure_tendency: Option<f64>,  // PTDY, hPa
    pub water_level: Option<f64>,        // TIDE, ft
}

impl Observation {
    /// An observation with every measurement absent.
    pub fn empty(station: &str, timestamp: &str, location: &str) -> Self {
        Observation {
            station: station.to_string(),
            timestamp: timestamp.to_string(),
            location: location.to_string(),
            wind_direction: None,
            wind_speed: None,
            gust_speed: None,
            wave_height: None,
            dom_wave_period: None,
            avg_wave_period: None,
            dom_wave_direction: None,
            sea_pressure: None,
            air_temp: None,
            sea_surface_temp: None,
            dewpoint_temp: None,
            visibility: None,
            pressure_tendency: None,
            water_level: None,
        }
    }

    /// The observation time as a calendar value.
    pub fn observed_at(&self) -> Result<NaiveDateTime, chrono::ParseError> {
        parse_timestamp(&self.timestamp)
    }
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
}

/// Returns `true` if `station` can be used verbatim as a table name.
///
/// Postgres truncates identifiers past 63 bytes, which would silently merge
/// stations sharing a prefix.
pub fn is_valid_station_id(station: &str) -> bool {
    !station.is_empty()
        && station.len() <= 63
        && station.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Coarse classification of a [`BuoyError`], used to decide what is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Parse,
    NoData,
    FeedUnavailable,
    Malformed,
    Storage,
    Config,
}

/// Errors that can arise anywhere in the ingestion pipeline.
#[derive(Debug, Error)]
pub enum BuoyError {
    /// The feed text does not have the expected column structure.
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// The fetch succeeded but produced no data rows.
    #[error("No data was retrieved from {url}")]
    NoDataRetrieved { url: String },

    /// The feed could not be fetched (connect, timeout, non-2xx).
    #[error("Feed unavailable at {url}: {reason}")]
    FeedUnavailable {
        url: String,
        reason: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// A raw row could not be turned into an [`Observation`].
    #[error("Malformed observation for station '{station}': {message}")]
    MalformedObservation { station: String, message: String },

    /// A storage round trip failed.
    #[error("Storage unavailable for station '{station}' during {operation}: {message}")]
    StorageUnavailable {
        station: String,
        operation: StoreOperation,
        message: String,
        #[source]
        source: Option<postgres::Error>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read configuration file '{path}'")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file '{path}'")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl BuoyError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BuoyError::Parse { .. } => FailureKind::Parse,
            BuoyError::NoDataRetrieved { .. } => FailureKind::NoData,
            BuoyError::FeedUnavailable { .. } => FailureKind::FeedUnavailable,
            BuoyError::MalformedObservation { .. } => FailureKind::Malformed,
            BuoyError::StorageUnavailable { .. } => FailureKind::Storage,
            BuoyError::Config(_) | BuoyError::ConfigRead { .. } | BuoyError::ConfigParse { .. } => {
                FailureKind::Config
            }
        }
    }

    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        BuoyError::Parse { line, message: message.into() }
    }

    pub(crate) fn malformed(station: &str, message: impl Into<String>) -> Self {
        BuoyError::MalformedObservation {
            station: station.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn storage(
        station: &str,
        operation: StoreOperation,
        source: postgres::Error,
    ) -> Self {
        BuoyError::StorageUnavailable {
            station: station.to_string(),
            operation,
            message: source.to_string(),
            source: Some(source),
        }
    }
}

/// The round trip a [`BuoyError::StorageUnavailable`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Connect,
    EnsureTable,
    ReadWatermark,
    Insert,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOperation::Connect => write!(f, "connect"),
            StoreOperation::EnsureTable => write!(f, "ensure-table"),
            StoreOperation::ReadWatermark => write!(f, "read-watermark"),
            StoreOperation::Insert => write!(f, "insert"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
