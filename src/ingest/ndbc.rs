/// NDBC (National Data Buoy Center) latest observations feed
///
/// Retrieves and parses `latest_obs.txt`, a whitespace-delimited table with
/// one line per active station:
///
/// ```text
/// #STN     LAT      LON  YYYY MM DD hh mm WDIR WSPD   GST  WVHT  DPD  APD MWD   PRES  PTDY  ATMP  WTMP  DEWP  VIS  TIDE
/// #text    deg      deg   yr mo day hr mn degT  m/s   m/s     m  sec  sec degT   hPa   hPa  degC  degC  degC  nmi    ft
/// 13009   8.000  -38.000 2023 03 11 22 00   MM   MM    MM    MM   MM   MM  MM     MM    MM    MM    MM    MM   MM    MM
/// ```
///
/// Feed documentation: https://www.ndbc.noaa.gov/docs/latest_obs.shtml

use std::collections::HashSet;
use std::time::Duration;

use crate::logging::{self, DataSource};
use crate::model::{BuoyError, FailureKind, FIELD_LOCATION, FIELD_TIMESTAMP, RawRow};
use crate::retry::RetryPolicy;

pub const NDBC_LATEST_OBS_URL: &str = "https://www.ndbc.noaa.gov/data/latest_obs/latest_obs.txt";

/// Columns folded into `Timestamp` and `Location`, dropped from parsed rows.
pub const SOURCE_COLUMNS: [&str; 7] = ["YYYY", "MM", "DD", "hh", "mm", "LAT", "LON"];

// ============================================================================
// Feed Parsing
// ============================================================================

/// Parse the raw feed body into rows keyed by header column.
///
/// The first non-blank line is the header and the line after it is the
/// units row, which is discarded unconditionally. Every data line must have
/// exactly one token per header column.
///
/// A body with no data lines parses to an empty `Vec`; deciding whether that
/// is an error is up to the caller.
pub fn parse_feed(text: &str) -> Result<Vec<RawRow>, BuoyError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line))
        .filter(|(_, line)| !line.trim().is_empty());

    let header: Vec<&str> = match lines.next() {
        Some((_, line)) => line.split_whitespace().collect(),
        None => return Ok(Vec::new()),
    };
    validate_header(&header)?;

    // Units row
    lines.next();

    let mut rows = Vec::new();
    for (line_no, line) in lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != header.len() {
            return Err(BuoyError::parse(
                line_no,
                format!("expected {} columns, found {}", header.len(), tokens.len()),
            ));
        }

        let row: RawRow = header.iter().copied().zip(tokens).collect();
        rows.push(derive_fields(row, line_no)?);
    }

    Ok(rows)
}

fn validate_header(header: &[&str]) -> Result<(), BuoyError> {
    let mut seen = HashSet::new();
    for name in header {
        if !seen.insert(*name) {
            return Err(BuoyError::parse(1, format!("duplicate column '{}'", name)));
        }
    }

    let missing: Vec<&str> = SOURCE_COLUMNS
        .iter()
        .copied()
        .filter(|c| !seen.contains(c))
        .collect();
    if !missing.is_empty() {
        return Err(BuoyError::parse(
            1,
            format!("header is missing columns: {}", missing.join(", ")),
        ));
    }

    Ok(())
}

/// Build `Timestamp` and `Location` and remove the columns they came from.
///
/// `Timestamp` is `YYYY-MM-DD hh:mm:00`; `Location` is `LAT,LON`, both taken
/// verbatim from the feed tokens.
pub fn derive_fields(mut row: RawRow, line_no: usize) -> Result<RawRow, BuoyError> {
    let mut take = |name: &str| {
        row.remove(name)
            .ok_or_else(|| BuoyError::parse(line_no, format!("missing column '{}'", name)))
    };

    let year = take("YYYY")?;
    let month = take("MM")?;
    let day = take("DD")?;
    let hour = take("hh")?;
    let minute = take("mm")?;
    let lat = take("LAT")?;
    let lon = take("LON")?;

    row.insert(
        FIELD_TIMESTAMP,
        format!("{}-{}-{} {}:{}:00", year, month, day, hour, minute),
    );
    row.insert(FIELD_LOCATION, format!("{},{}", lat, lon));

    Ok(row)
}

// ============================================================================
// Feed Sources
// ============================================================================

/// Something that can produce the raw feed body.
pub trait FeedSource {
    /// Location of the feed, for error messages and logs.
    fn location(&self) -> &str;

    /// Perform one fetch. Transport failures are `FeedUnavailable`.
    fn fetch(&self) -> Result<String, BuoyError>;
}

/// Blocking HTTP fetch of the configured feed URL.
pub struct HttpFeedSource {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpFeedSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, BuoyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BuoyError::FeedUnavailable {
                url: url.to_string(),
                reason: "could not build HTTP client".to_string(),
                source: Some(e),
            })?;

        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: reqwest::blocking::Client, url: &str) -> Self {
        HttpFeedSource {
            client,
            url: url.to_string(),
        }
    }

    fn unavailable(&self, reason: &str, source: Option<reqwest::Error>) -> BuoyError {
        BuoyError::FeedUnavailable {
            url: self.url.clone(),
            reason: reason.to_string(),
            source,
        }
    }
}

impl FeedSource for HttpFeedSource {
    fn location(&self) -> &str {
        &self.url
    }

    fn fetch(&self) -> Result<String, BuoyError> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "text/plain")
            .send()
            .map_err(|e| self.unavailable("request failed", Some(e)))?;

        if !response.status().is_success() {
            return Err(self.unavailable(&format!("HTTP error: {}", response.status()), None));
        }

        response
            .text()
            .map_err(|e| self.unavailable("failed to read response body", Some(e)))
    }
}

// ============================================================================
// Retrieval
// ============================================================================

/// Fetches the feed from a [`FeedSource`] and parses it into raw rows.
pub struct FeedRetriever<S: FeedSource> {
    source: S,
}

impl<S: FeedSource> FeedRetriever<S> {
    pub fn new(source: S) -> Self {
        FeedRetriever { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// One fetch-and-parse. An empty result is `NoDataRetrieved`.
    pub fn retrieve(&self) -> Result<Vec<RawRow>, BuoyError> {
        let body = self.source.fetch()?;
        let rows = parse_feed(&body)?;

        if rows.is_empty() {
            return Err(BuoyError::NoDataRetrieved {
                url: self.source.location().to_string(),
            });
        }

        logging::debug(
            DataSource::Ndbc,
            None,
            &format!("Parsed {} rows from {}", rows.len(), self.source.location()),
        );
        Ok(rows)
    }

    /// [`retrieve`](Self::retrieve) under `policy`, retrying only
    /// `NoDataRetrieved`. Transport and parse failures surface on the first
    /// attempt.
    pub fn retrieve_with_retry(&self, policy: &RetryPolicy) -> Result<Vec<RawRow>, BuoyError> {
        policy.run(FailureKind::NoData, || self.retrieve())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    const SAMPLE_FEED: &str = "\
#STN     LAT      LON  YYYY MM DD hh mm WDIR WSPD   GST  WVHT  DPD  APD MWD   PRES  PTDY  ATMP  WTMP  DEWP  VIS  TIDE
#text    deg      deg   yr mo day hr mn degT  m/s   m/s     m  sec  sec degT   hPa   hPa  degC  degC  degC  nmi    ft
13009   8.000  -38.000 2023 03 11 22 00   MM   MM    MM    MM   MM   MM  MM     MM    MM    MM    MM    MM   MM    MM
41001  34.724  -72.317 2023 03 11 21 50  250  8.0  10.0   2.1    9  6.1 110 1015.2  -1.1  14.3  21.0  10.1   MM    MM
";

    /// Feed source returning a scripted sequence of bodies.
    struct ScriptedSource {
        bodies: RefCell<Vec<Result<String, BuoyError>>>,
        calls: Cell<usize>,
    }

    impl ScriptedSource {
        fn always(body: &str) -> Self {
            ScriptedSource {
                bodies: RefCell::new((0..8).map(|_| Ok(body.to_string())).collect()),
                calls: Cell::new(0),
            }
        }
    }

    impl FeedSource for ScriptedSource {
        fn location(&self) -> &str {
            "test://latest_obs.txt"
        }

        fn fetch(&self) -> Result<String, BuoyError> {
            self.calls.set(self.calls.get() + 1);
            self.bodies.borrow_mut().remove(0)
        }
    }

    // --- parse_feed ---------------------------------------------------------

    #[test]
    fn test_parse_discards_units_row() {
        let rows = parse_feed(SAMPLE_FEED).expect("sample feed should parse");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("#STN"), Some("13009"));
        assert_eq!(rows[1].get("#STN"), Some("41001"));
    }

    #[test]
    fn test_parse_derives_timestamp_and_location() {
        let rows = parse_feed(SAMPLE_FEED).unwrap();
        assert_eq!(rows[0].get("Timestamp"), Some("2023-03-11 22:00:00"));
        assert_eq!(rows[0].get("Location"), Some("8.000,-38.000"));
        assert_eq!(rows[1].get("Timestamp"), Some("2023-03-11 21:50:00"));
    }

    #[test]
    fn test_parse_removes_source_columns_and_adds_two() {
        let header_width = SAMPLE_FEED.lines().next().unwrap().split_whitespace().count();
        let rows = parse_feed(SAMPLE_FEED).unwrap();

        for row in &rows {
            assert_eq!(row.len(), header_width - SOURCE_COLUMNS.len() + 2);
            for column in SOURCE_COLUMNS {
                assert!(!row.contains(column), "{} should have been removed", column);
            }
        }
    }

    #[test]
    fn test_parse_minimal_columns() {
        let feed = concat!(
            "LAT LON YYYY MM DD hh mm\n",
            "Unwanted data x x x x x x\n",
            "123 456 2023 01 01 00 00\n",
        );
        let rows = parse_feed(feed).unwrap();

        let expected: RawRow = [("Timestamp", "2023-01-01 00:00:00"), ("Location", "123,456")]
            .into_iter()
            .collect();
        assert_eq!(rows, vec![expected]);
    }

    #[test]
    fn test_parse_header_only_yields_no_rows() {
        let feed: String = SAMPLE_FEED.lines().take(2).collect::<Vec<_>>().join("\n");
        assert!(parse_feed(&feed).unwrap().is_empty());
        assert!(parse_feed("").unwrap().is_empty());
        assert!(parse_feed("\n  \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_ragged_row_is_parse_error() {
        let feed = format!("{}41002  31.8 -74.8 2023 03 11 22 00 MM\n", SAMPLE_FEED);
        match parse_feed(&feed) {
            Err(BuoyError::Parse { line, .. }) => assert_eq!(line, 5),
            other => panic!("expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_header_without_date_columns_is_parse_error() {
        let feed = "#STN LAT LON WDIR\n#text deg deg degT\n41001 1 2 MM\n";
        let err = parse_feed(feed).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Parse);
        assert!(err.to_string().contains("YYYY"));
    }

    #[test]
    fn test_parse_duplicate_header_column_is_parse_error() {
        let feed = "LAT LON YYYY MM DD hh mm LAT\nu u u u u u u u\n1 2 2023 01 01 00 00 3\n";
        assert!(matches!(parse_feed(feed), Err(BuoyError::Parse { .. })));
    }

    // --- FeedRetriever ------------------------------------------------------

    #[test]
    fn test_retrieve_returns_parsed_rows() {
        let retriever = FeedRetriever::new(ScriptedSource::always(SAMPLE_FEED));
        let rows = retriever.retrieve().unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_retrieve_empty_feed_is_no_data() {
        let header_only: String = SAMPLE_FEED.lines().take(2).collect::<Vec<_>>().join("\n");
        let retriever = FeedRetriever::new(ScriptedSource::always(&header_only));
        assert!(matches!(
            retriever.retrieve(),
            Err(BuoyError::NoDataRetrieved { .. })
        ));
    }

    #[test]
    fn test_retrieve_with_retry_calls_fetch_three_times_for_empty_feed() {
        let retriever = FeedRetriever::new(ScriptedSource::always(""));
        let policy = RetryPolicy::new(3, Duration::ZERO, 2.0);

        let result = retriever.retrieve_with_retry(&policy);

        assert!(matches!(result, Err(BuoyError::NoDataRetrieved { .. })));
        assert_eq!(retriever.source().calls.get(), 3);
    }

    #[test]
    fn test_retrieve_with_retry_does_not_retry_feed_unavailable() {
        let source = ScriptedSource {
            bodies: RefCell::new(vec![Err(BuoyError::FeedUnavailable {
                url: "test://latest_obs.txt".to_string(),
                reason: "connection refused".to_string(),
                source: None,
            })]),
            calls: Cell::new(0),
        };
        let retriever = FeedRetriever::new(source);

        let result = retriever.retrieve_with_retry(&RetryPolicy::new(3, Duration::ZERO, 2.0));

        assert!(matches!(result, Err(BuoyError::FeedUnavailable { .. })));
        assert_eq!(retriever.source().calls.get(), 1);
    }

    #[test]
    fn test_retrieve_with_retry_recovers_when_feed_fills_in() {
        let source = ScriptedSource {
            bodies: RefCell::new(vec![Ok(String::new()), Ok(SAMPLE_FEED.to_string())]),
            calls: Cell::new(0),
        };
        let retriever = FeedRetriever::new(source);

        let rows = retriever
            .retrieve_with_retry(&RetryPolicy::new(3, Duration::ZERO, 2.0))
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(retriever.source().calls.get(), 2);
    }

    // --- HttpFeedSource -----------------------------------------------------

    /// Counts fetches made through a real HTTP source.
    struct CountingHttpSource {
        inner: HttpFeedSource,
        calls: Cell<usize>,
    }

    impl FeedSource for CountingHttpSource {
        fn location(&self) -> &str {
            self.inner.location()
        }

        fn fetch(&self) -> Result<String, BuoyError> {
            self.calls.set(self.calls.get() + 1);
            self.inner.fetch()
        }
    }

    #[test]
    fn test_connection_refused_is_feed_unavailable_and_not_retried() {
        // Nothing listens on port 1
        let url = "http://127.0.0.1:1/latest_obs.txt";
        let inner = HttpFeedSource::new(url, Duration::from_secs(5)).unwrap();
        let retriever = FeedRetriever::new(CountingHttpSource { inner, calls: Cell::new(0) });

        let result = retriever.retrieve_with_retry(&RetryPolicy::new(3, Duration::ZERO, 2.0));

        match result {
            Err(BuoyError::FeedUnavailable { url: failed_url, source, .. }) => {
                assert_eq!(failed_url, url);
                assert!(source.is_some(), "transport error should be kept as the source");
            }
            other => panic!("expected FeedUnavailable, got {:?}", other),
        }
        assert_eq!(retriever.source().calls.get(), 1);
    }
}
