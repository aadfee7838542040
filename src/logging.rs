/// Structured logging for the buoy ingestion service
///
/// Provides context-rich logging with data-source and station identifiers,
/// timestamps, and severity levels. The logger is installed as the `log`
/// crate backend, so anything in the process that logs through `log` ends up
/// on the same console and log file.

use chrono::Utc;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;

use crate::model::FailureKind;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl LogLevel {
    /// Parse a level name from configuration. Accepts the `log` crate's
    /// names as well as `warning`.
    pub fn from_name(name: &str) -> Option<LogLevel> {
        match name.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }

    fn from_log_level(level: log::Level) -> LogLevel {
        match level {
            log::Level::Error => LogLevel::Error,
            log::Level::Warn => LogLevel::Warning,
            log::Level::Info => LogLevel::Info,
            log::Level::Debug | log::Level::Trace => LogLevel::Debug,
        }
    }
}

// ---------------------------------------------------------------------------
// Data Source Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Ndbc,
    Database,
    System,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl DataSource {
    /// Tag used both for display and as the `log` target.
    fn tag(&self) -> &'static str {
        match self {
            DataSource::Ndbc => "NDBC",
            DataSource::Database => "DB",
            DataSource::System => "SYS",
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - the feed is between publications or a row was skipped
    Expected,
    /// Unexpected failure - indicates service degradation or configuration issue
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Optional file path for logging
    log_file: Option<String>,
    /// Whether to include timestamps in console output
    console_timestamps: bool,
}

impl Logger {
    pub fn new(min_level: LogLevel, log_file: Option<String>, console_timestamps: bool) -> Self {
        Logger {
            min_level,
            log_file,
            console_timestamps,
        }
    }

    /// Full entry as written to the log file.
    fn format_entry(level: LogLevel, target: &str, message: &str) -> String {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        format!("{} {} {}: {}", timestamp, level, target, message)
    }

    fn write_console(&self, level: LogLevel, target: &str, message: &str, entry: &str) {
        if self.console_timestamps {
            match level {
                LogLevel::Error => eprintln!("{}", entry),
                LogLevel::Warning => eprintln!("   {}", entry),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => println!("   [DEBUG] {}", message),
            }
        } else {
            match level {
                LogLevel::Error => eprintln!("   ✗ {}: {}", target, message),
                LogLevel::Warning => eprintln!("   ⚠ {}: {}", target, message),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => {}  // Skip debug in non-timestamp mode
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        LogLevel::from_log_level(metadata.level()) >= self.min_level
    }

    fn log(&self, record: &log::Record) {
        if !log::Log::enabled(self, record.metadata()) {
            return;
        }

        let level = LogLevel::from_log_level(record.level());
        let message = record.args().to_string();
        let entry = Self::format_entry(level, record.target(), &message);

        self.write_console(level, record.target(), &message, &entry);

        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn flush(&self) {}
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Install the process logger. Returns `false` if a logger was already set,
/// in which case the existing one stays in place.
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>, console_timestamps: bool) -> bool {
    let logger = Logger::new(min_level, log_file.map(String::from), console_timestamps);
    match log::set_boxed_logger(Box::new(logger)) {
        Ok(()) => {
            log::set_max_level(min_level.as_log_level().to_level_filter());
            true
        }
        Err(_) => false,
    }
}

fn emit(level: LogLevel, source: DataSource, station: Option<&str>, message: &str) {
    let station_part = station.map(|s| format!(" [{}]", s)).unwrap_or_default();
    log::log!(
        target: source.tag(),
        level.as_log_level(),
        "{}{}",
        message,
        station_part
    );
}

/// Log a general informational message
pub fn info(source: DataSource, station: Option<&str>, message: &str) {
    emit(LogLevel::Info, source, station, message);
}

/// Log a warning message
pub fn warn(source: DataSource, station: Option<&str>, message: &str) {
    emit(LogLevel::Warning, source, station, message);
}

/// Log an error message
pub fn error(source: DataSource, station: Option<&str>, message: &str) {
    emit(LogLevel::Error, source, station, message);
}

/// Log a debug message
pub fn debug(source: DataSource, station: Option<&str>, message: &str) {
    emit(LogLevel::Debug, source, station, message);
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a pipeline failure by its kind.
pub fn classify_failure(kind: FailureKind) -> FailureType {
    match kind {
        // The feed is regenerated every few minutes; an empty body in between
        // is normal and already retried.
        FailureKind::NoData => FailureType::Expected,
        // Parse errors suggest a feed format change
        FailureKind::Parse | FailureKind::Config => FailureType::Unexpected,
        FailureKind::FeedUnavailable | FailureKind::Storage => FailureType::Unexpected,
        // One buoy sending garbage is not a service problem
        FailureKind::Malformed => FailureType::Unknown,
    }
}

/// Log a pipeline failure with automatic classification
pub fn log_failure(
    source: DataSource,
    station: Option<&str>,
    operation: &str,
    err: &crate::model::BuoyError,
) {
    let failure_type = classify_failure(err.kind());

    let message = format!(
        "{} failed [{}]: {}",
        operation,
        failure_type,
        err
    );

    match failure_type {
        FailureType::Expected => debug(source, station, &message),
        FailureType::Unexpected => error(source, station, &message),
        FailureType::Unknown => warn(source, station, &message),
    }
}

// ---------------------------------------------------------------------------
// Run Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of one ingestion run
pub fn log_run_summary(total: usize, inserted: usize, skipped: usize, failed: usize) {
    let message = format!(
        "Run complete: {}/{} inserted, {} already stored, {} failed",
        inserted,
        total,
        skipped,
        failed
    );

    if failed == 0 {
        info(DataSource::System, None, &message);
    } else if inserted + skipped == 0 {
        error(DataSource::System, None, &message);
    } else {
        warn(DataSource::System, None, &message);
    }
}
