/// One ingestion cycle: retrieve → map → store.
///
/// Retrieval and mapping failures abort the cycle and are returned to the
/// caller. Storage failures are per observation: they are logged, counted,
/// and the cycle moves on to the next observation.

use crate::db::{IncrementalStore, StationBackend, StoreOutcome};
use crate::ingest::mapper::{map_rows, map_rows_lenient};
use crate::ingest::ndbc::{FeedRetriever, FeedSource};
use crate::logging::{self, DataSource};
use crate::model::BuoyError;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Data rows in the feed after the header and units rows.
    pub fetched_rows: usize,
    pub mapped: usize,
    /// Rows dropped by lenient mapping.
    pub rejected_rows: usize,
    pub inserted: usize,
    pub skipped: usize,
    /// Observations whose storage failed.
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub retry: RetryPolicy,
    pub skip_malformed_rows: bool,
}

pub fn run_cycle<S, B>(
    retriever: &FeedRetriever<S>,
    store: &mut IncrementalStore<B>,
    options: &RunOptions,
) -> Result<RunSummary, BuoyError>
where
    S: FeedSource,
    B: StationBackend,
{
    logging::info(DataSource::Ndbc, None, "Retrieving active buoys");
    let rows = retriever.retrieve_with_retry(&options.retry)?;
    logging::info(
        DataSource::Ndbc,
        None,
        &format!("Active buoys retrieved: {} rows", rows.len()),
    );

    let mut summary = RunSummary {
        fetched_rows: rows.len(),
        ..RunSummary::default()
    };

    let observations = if options.skip_malformed_rows {
        let (observations, rejected) = map_rows_lenient(&rows);
        for err in &rejected {
            logging::log_failure(DataSource::Ndbc, None, "Mapping row", err);
        }
        summary.rejected_rows = rejected.len();
        observations
    } else {
        map_rows(&rows)?
    };
    summary.mapped = observations.len();

    for observation in &observations {
        match store.store(observation) {
            Ok(StoreOutcome::Inserted) => summary.inserted += 1,
            Ok(StoreOutcome::Skipped { .. }) => summary.skipped += 1,
            Err(err) => {
                summary.failed += 1;
                logging::log_failure(
                    DataSource::Database,
                    Some(&observation.station),
                    "Storing observation",
                    &err,
                );
            }
        }
    }

    logging::log_run_summary(summary.mapped, summary.inserted, summary.skipped, summary.failed);
    Ok(summary)
}
