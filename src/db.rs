/// Incremental, per-station storage of observations.
///
/// Every station gets its own table, created on first sight. An observation
/// is inserted only if its timestamp is strictly later than the newest one
/// already stored for that station (the watermark), so re-running a cycle
/// over the same feed stores nothing twice.
///
/// # Round trips
/// Each call to [`IncrementalStore::store`] is three round trips against the
/// backend: ensure-table, read-watermark and (maybe) insert. The Postgres
/// backend opens a connection for each and drops it at the end of the
/// operation; no connection outlives a single step.

use chrono::NaiveDateTime;
use postgres::{Client, NoTls};

use crate::logging::{self, DataSource};
use crate::model::{
    is_valid_station_id, parse_timestamp, BuoyError, FailureKind, Observation, StoreOperation,
    TIMESTAMP_FORMAT, WATERMARK_EPOCH,
};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// The three storage primitives the incremental store is built from.
///
/// Implementations report every failure as `StorageUnavailable`.
pub trait StationBackend {
    /// Create the station's table if it does not exist. Must succeed when it
    /// already does.
    fn ensure_table(&mut self, station: &str) -> Result<(), BuoyError>;

    /// Newest stored timestamp for the station, or `None` if it has no rows.
    fn max_timestamp(&mut self, station: &str) -> Result<Option<String>, BuoyError>;

    fn insert(&mut self, observation: &Observation) -> Result<(), BuoyError>;
}

/// Result of a successful [`IncrementalStore::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    /// Not newer than what is already stored; nothing was written.
    Skipped { watermark: String },
}

// ---------------------------------------------------------------------------
// Incremental store
// ---------------------------------------------------------------------------

pub struct IncrementalStore<B: StationBackend> {
    backend: B,
    retry: Option<RetryPolicy>,
}

impl<B: StationBackend> IncrementalStore<B> {
    pub fn new(backend: B) -> Self {
        IncrementalStore { backend, retry: None }
    }

    /// Retry each round trip under `policy` when it fails with
    /// `StorageUnavailable`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn store(&mut self, observation: &Observation) -> Result<StoreOutcome, BuoyError> {
        let station = observation.station.as_str();
        let observed_at = observation.observed_at().map_err(|e| {
            BuoyError::malformed(station, format!("timestamp '{}': {}", observation.timestamp, e))
        })?;

        self.round_trip(|b| b.ensure_table(station))?;

        let watermark = match self.round_trip(|b| b.max_timestamp(station))? {
            Some(stored) => parse_watermark(station, &stored)?,
            None => WATERMARK_EPOCH,
        };

        if observed_at <= watermark {
            let watermark_text = watermark.format(TIMESTAMP_FORMAT).to_string();
            logging::debug(
                DataSource::Database,
                Some(station),
                &format!(
                    "{} is not newer than stored {}, skipping",
                    observation.timestamp, watermark_text
                ),
            );
            return Ok(StoreOutcome::Skipped { watermark: watermark_text });
        }

        self.round_trip(|b| b.insert(observation))?;
        logging::debug(
            DataSource::Database,
            Some(station),
            &format!("Stored observation at {}", observation.timestamp),
        );
        Ok(StoreOutcome::Inserted)
    }

    fn round_trip<T, F>(&mut self, mut op: F) -> Result<T, BuoyError>
    where
        F: FnMut(&mut B) -> Result<T, BuoyError>,
    {
        let backend = &mut self.backend;
        match &self.retry {
            Some(policy) => policy.run(FailureKind::Storage, || op(&mut *backend)),
            None => op(backend),
        }
    }
}

fn parse_watermark(station: &str, value: &str) -> Result<NaiveDateTime, BuoyError> {
    parse_timestamp(value).map_err(|e| BuoyError::StorageUnavailable {
        station: station.to_string(),
        operation: StoreOperation::ReadWatermark,
        message: format!("stored timestamp '{}' is unreadable: {}", value, e),
        source: None,
    })
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

/// Quoted table identifier for a station.
///
/// Identifiers cannot be bound as parameters, so the station id is checked
/// against a strict alphabet before it is ever placed in SQL text.
pub fn station_table(station: &str) -> Result<String, BuoyError> {
    if !is_valid_station_id(station) {
        return Err(BuoyError::malformed(station, "station id is not a valid table name"));
    }
    Ok(format!("\"{}\"", station))
}

pub fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            station            VARCHAR(255) NOT NULL,
            \"timestamp\"        VARCHAR(255) NOT NULL,
            location           VARCHAR(255) NOT NULL,
            wind_direction     INTEGER,
            wind_speed         DOUBLE PRECISION,
            gust_speed         DOUBLE PRECISION,
            wave_height        DOUBLE PRECISION,
            dom_wave_period    DOUBLE PRECISION,
            avg_wave_period    DOUBLE PRECISION,
            dom_wave_direction INTEGER,
            sea_pressure       DOUBLE PRECISION,
            air_temp           DOUBLE PRECISION,
            sea_surface_temp   DOUBLE PRECISION,
            dewpoint_temp      DOUBLE PRECISION,
            visibility         DOUBLE PRECISION,
            pressure_tendency  DOUBLE PRECISION,
            water_level        DOUBLE PRECISION
        )",
        table
    )
}

pub fn max_timestamp_sql(table: &str) -> String {
    format!("SELECT MAX(\"timestamp\") FROM {}", table)
}

pub fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} (
            station, \"timestamp\", location,
            wind_direction, wind_speed, gust_speed, wave_height,
            dom_wave_period, avg_wave_period, dom_wave_direction,
            sea_pressure, air_temp, sea_surface_temp, dewpoint_temp,
            visibility, pressure_tendency, water_level
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        table
    )
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

/// [`StationBackend`] over a Postgres database, one connection per operation.
pub struct PostgresBackend {
    params: postgres::Config,
}

impl PostgresBackend {
    pub fn new(params: postgres::Config) -> Self {
        PostgresBackend { params }
    }

    /// Backend from a `postgres://` URL or key-value connection string.
    pub fn from_url(url: &str) -> Result<Self, BuoyError> {
        let params = url
            .parse::<postgres::Config>()
            .map_err(|e| BuoyError::Config(format!("invalid database URL: {}", e)))?;
        Ok(Self::new(params))
    }

    fn connect(&self, station: &str) -> Result<Client, BuoyError> {
        self.params
            .connect(NoTls)
            .map_err(|e| BuoyError::storage(station, StoreOperation::Connect, e))
    }
}

impl StationBackend for PostgresBackend {
    fn ensure_table(&mut self, station: &str) -> Result<(), BuoyError> {
        let table = station_table(station)?;
        let mut client = self.connect(station)?;
        client
            .batch_execute(&create_table_sql(&table))
            .map_err(|e| BuoyError::storage(station, StoreOperation::EnsureTable, e))
    }

    fn max_timestamp(&mut self, station: &str) -> Result<Option<String>, BuoyError> {
        let table = station_table(station)?;
        let mut client = self.connect(station)?;
        let row = client
            .query_one(max_timestamp_sql(&table).as_str(), &[])
            .map_err(|e| BuoyError::storage(station, StoreOperation::ReadWatermark, e))?;
        row.try_get::<_, Option<String>>(0)
            .map_err(|e| BuoyError::storage(station, StoreOperation::ReadWatermark, e))
    }

    fn insert(&mut self, obs: &Observation) -> Result<(), BuoyError> {
        let station = obs.station.as_str();
        let table = station_table(station)?;
        let mut client = self.connect(station)?;
        client
            .execute(
                insert_sql(&table).as_str(),
                &[
                    &obs.station,
                    &obs.timestamp,
                    &obs.location,
                    &obs.wind_direction,
                    &obs.wind_speed,
                    &obs.gust_speed,
                    &obs.wave_height,
                    &obs.dom_wave_period,
                    &obs.avg_wave_period,
                    &obs.dom_wave_direction,
                    &obs.sea_pressure,
                    &obs.air_temp,
                    &obs.sea_surface_temp,
                    &obs.dewpoint_temp,
                    &obs.visibility,
                    &obs.pressure_tendency,
                    &obs.water_level,
                ],
            )
            .map(|_| ())
            .map_err(|e| BuoyError::storage(station, StoreOperation::Insert, e))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory backend recording every call.
    #[derive(Default)]
    struct MemoryBackend {
        tables: HashMap<String, Vec<Observation>>,
        calls: Vec<&'static str>,
        fail_on: Option<(&'static str, usize)>,
    }

    impl MemoryBackend {
        fn check(
            &mut self,
            op: &'static str,
            station: &str,
            operation: StoreOperation,
        ) -> Result<(), BuoyError> {
            self.calls.push(op);
            if let Some((fail_op, remaining)) = self.fail_on.as_mut() {
                if *fail_op == op && *remaining > 0 {
                    *remaining -= 1;
                    return Err(BuoyError::StorageUnavailable {
                        station: station.to_string(),
                        operation,
                        message: "connection refused".to_string(),
                        source: None,
                    });
                }
            }
            Ok(())
        }

        fn rows(&self, station: &str) -> usize {
            self.tables.get(station).map(Vec::len).unwrap_or(0)
        }
    }

    impl StationBackend for MemoryBackend {
        fn ensure_table(&mut self, station: &str) -> Result<(), BuoyError> {
            self.check("ensure", station, StoreOperation::EnsureTable)?;
            self.tables.entry(station.to_string()).or_default();
            Ok(())
        }

        fn max_timestamp(&mut self, station: &str) -> Result<Option<String>, BuoyError> {
            self.check("max", station, StoreOperation::ReadWatermark)?;
            Ok(self.tables[station].iter().map(|o| o.timestamp.clone()).max())
        }

        fn insert(&mut self, observation: &Observation) -> Result<(), BuoyError> {
            self.check("insert", &observation.station, StoreOperation::Insert)?;
            self.tables
                .get_mut(&observation.station)
                .expect("insert before ensure_table")
                .push(observation.clone());
            Ok(())
        }
    }

    fn obs(station: &str, timestamp: &str) -> Observation {
        Observation::empty(station, timestamp, "34.724,-72.317")
    }

    #[test]
    fn test_first_observation_for_station_is_inserted() {
        let mut store = IncrementalStore::new(MemoryBackend::default());

        let outcome = store.store(&obs("41001", "2023-03-11 21:50:00")).unwrap();

        assert_eq!(outcome, StoreOutcome::Inserted);
        assert_eq!(store.backend().rows("41001"), 1);
        assert_eq!(store.backend().calls, vec!["ensure", "max", "insert"]);
    }

    #[test]
    fn test_empty_station_accepts_observations_at_or_before_unix_epoch() {
        let mut store = IncrementalStore::new(MemoryBackend::default());

        let epoch = store.store(&obs("41001", "1970-01-01 00:00:00")).unwrap();
        let year_zero = store.store(&obs("13009", "0000-01-01 00:00:00")).unwrap();

        assert_eq!(epoch, StoreOutcome::Inserted);
        assert_eq!(year_zero, StoreOutcome::Inserted);
        assert_eq!(store.backend().rows("41001"), 1);
        assert_eq!(store.backend().rows("13009"), 1);
    }

    #[test]
    fn test_storing_same_observation_twice_persists_once() {
        let mut store = IncrementalStore::new(MemoryBackend::default());
        let o = obs("41001", "2023-03-11 21:50:00");

        assert_eq!(store.store(&o).unwrap(), StoreOutcome::Inserted);
        assert_eq!(
            store.store(&o).unwrap(),
            StoreOutcome::Skipped { watermark: "2023-03-11 21:50:00".to_string() }
        );
        assert_eq!(store.backend().rows("41001"), 1);
    }

    #[test]
    fn test_older_observation_is_skipped_newer_is_inserted() {
        let mut store = IncrementalStore::new(MemoryBackend::default());
        store.store(&obs("41001", "2023-01-01 00:00:00")).unwrap();

        let older = store.store(&obs("41001", "2020-01-01 00:00:00")).unwrap();
        let newer = store.store(&obs("41001", "2023-06-01 00:00:00")).unwrap();

        assert!(matches!(older, StoreOutcome::Skipped { .. }));
        assert_eq!(newer, StoreOutcome::Inserted);
        assert_eq!(store.backend().rows("41001"), 2);
    }

    #[test]
    fn test_watermarks_are_per_station() {
        let mut store = IncrementalStore::new(MemoryBackend::default());
        store.store(&obs("41001", "2023-06-01 00:00:00")).unwrap();

        let other = store.store(&obs("13009", "2023-01-01 00:00:00")).unwrap();

        assert_eq!(other, StoreOutcome::Inserted);
    }

    #[test]
    fn test_skip_does_not_issue_insert() {
        let mut store = IncrementalStore::new(MemoryBackend::default());
        let o = obs("41001", "2023-03-11 21:50:00");
        store.store(&o).unwrap();
        store.backend_mut().calls.clear();

        store.store(&o).unwrap();

        assert_eq!(store.backend().calls, vec!["ensure", "max"]);
    }

    #[test]
    fn test_ensure_table_failure_is_storage_unavailable() {
        let backend = MemoryBackend { fail_on: Some(("ensure", 1)), ..Default::default() };
        let mut store = IncrementalStore::new(backend);

        let err = store.store(&obs("41001", "2023-03-11 21:50:00")).unwrap_err();

        assert!(matches!(
            err,
            BuoyError::StorageUnavailable { operation: StoreOperation::EnsureTable, .. }
        ));
        assert_eq!(store.backend().calls, vec!["ensure"]);
    }

    #[test]
    fn test_insert_failure_is_storage_unavailable() {
        let backend = MemoryBackend { fail_on: Some(("insert", 1)), ..Default::default() };
        let mut store = IncrementalStore::new(backend);

        let err = store.store(&obs("41001", "2023-03-11 21:50:00")).unwrap_err();

        assert_eq!(err.kind(), FailureKind::Storage);
        assert_eq!(store.backend().rows("41001"), 0);
    }

    #[test]
    fn test_retrying_store_recovers_from_transient_failure() {
        let backend = MemoryBackend { fail_on: Some(("max", 1)), ..Default::default() };
        let policy = RetryPolicy::new(3, std::time::Duration::ZERO, 2.0);
        let mut store = IncrementalStore::new(backend).with_retry(policy);

        let outcome = store.store(&obs("41001", "2023-03-11 21:50:00")).unwrap();

        assert_eq!(outcome, StoreOutcome::Inserted);
        assert_eq!(store.backend().calls, vec!["ensure", "max", "max", "insert"]);
    }

    #[test]
    fn test_unreadable_stored_watermark_is_storage_unavailable() {
        let mut backend = MemoryBackend::default();
        backend.tables.insert("41001".to_string(), vec![obs("41001", "garbage")]);
        let mut store = IncrementalStore::new(backend);

        let err = store.store(&obs("41001", "2023-03-11 21:50:00")).unwrap_err();

        assert!(matches!(
            err,
            BuoyError::StorageUnavailable { operation: StoreOperation::ReadWatermark, .. }
        ));
    }

    #[test]
    fn test_station_table_quotes_valid_ids_and_rejects_others() {
        assert_eq!(station_table("41001").unwrap(), "\"41001\"");
        assert!(station_table("41001\" ; DROP TABLE x").is_err());
        assert!(station_table("").is_err());
    }

    #[test]
    fn test_insert_sql_binds_every_column() {
        let sql = insert_sql("\"41001\"");
        for n in 1..=17 {
            assert!(sql.contains(&format!("${}", n)), "missing placeholder ${}", n);
        }
        assert!(!sql.contains("$18"));
    }

    #[test]
    fn test_create_table_is_idempotent_statement() {
        let sql = create_table_sql("\"41001\"");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"41001\""));
        assert_eq!(sql.matches("INTEGER").count(), 2);
        assert_eq!(sql.matches("DOUBLE PRECISION").count(), 12);
    }
}
