/// Buoy ingestion service - one fetch/store cycle per invocation.
///
/// Usage: `buoy_ingest [CONFIG_PATH]` (defaults to `buoy_ingest.toml`).
/// Meant to be scheduled (cron, systemd timer) at the feed's publication
/// interval; each run only stores observations newer than what is already
/// in the database.

use std::path::PathBuf;
use std::process::ExitCode;

use buoy_ingest::config::{Config, DEFAULT_CONFIG_PATH};
use buoy_ingest::db::{IncrementalStore, PostgresBackend};
use buoy_ingest::ingest::ndbc::{FeedRetriever, HttpFeedSource};
use buoy_ingest::logging::{self, DataSource};
use buoy_ingest::model::FailureKind;
use buoy_ingest::pipeline::{run_cycle, RunOptions};

fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ {}", e);
            return ExitCode::FAILURE;
        }
    };

    // validate() has already checked the level name
    let min_level = config.logging.min_level().unwrap_or(logging::LogLevel::Info);
    logging::init_logger(min_level, config.logging.file.as_deref(), config.logging.timestamps);

    let source = match HttpFeedSource::new(&config.feed.url, config.feed.timeout()) {
        Ok(source) => source,
        Err(e) => {
            logging::log_failure(DataSource::System, None, "Building HTTP client", &e);
            return ExitCode::FAILURE;
        }
    };
    let retriever = FeedRetriever::new(source);

    let retry = config.retry.policy();
    let backend = PostgresBackend::new(config.database.connection_params());
    let mut store = IncrementalStore::new(backend);
    if config.pipeline.retry_storage {
        store = store.with_retry(retry.clone());
    }

    let options = RunOptions {
        retry,
        skip_malformed_rows: config.pipeline.skip_malformed_rows,
    };

    match run_cycle(&retriever, &mut store, &options) {
        Ok(summary) if summary.failed == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            let source = match e.kind() {
                FailureKind::NoData | FailureKind::FeedUnavailable | FailureKind::Parse => {
                    DataSource::Ndbc
                }
                _ => DataSource::System,
            };
            logging::error(source, None, &format!("An error has occurred: {}", e));
            ExitCode::FAILURE
        }
    }
}
