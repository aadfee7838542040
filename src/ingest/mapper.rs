/// Raw feed rows → typed [`Observation`]s.
///
/// Every measurement column is either the `MM` sentinel, which becomes
/// `None`, or a number of the column's declared kind. Anything else is a
/// `MalformedObservation`; so is a row without a usable station, timestamp
/// or location.

use std::str::FromStr;

use chrono::Datelike;

use crate::model::{
    is_valid_station_id, parse_timestamp, BuoyError, Observation, RawRow, FIELD_LOCATION,
    FIELD_STATION, FIELD_TIMESTAMP, MAX_OBSERVATION_YEAR, MIN_OBSERVATION_YEAR,
    MISSING_SENTINEL, TIMESTAMP_FORMAT,
};

/// Fail-fast mapping: the first bad row aborts the pass.
/// Output order matches input order.
pub fn map_rows(rows: &[RawRow]) -> Result<Vec<Observation>, BuoyError> {
    rows.iter().map(map_row).collect()
}

/// Per-row mapping that keeps every row that maps and returns the errors for
/// the rest, in input order.
pub fn map_rows_lenient(rows: &[RawRow]) -> (Vec<Observation>, Vec<BuoyError>) {
    let mut observations = Vec::with_capacity(rows.len());
    let mut rejected = Vec::new();

    for row in rows {
        match map_row(row) {
            Ok(obs) => observations.push(obs),
            Err(e) => rejected.push(e),
        }
    }

    (observations, rejected)
}

pub fn map_row(row: &RawRow) -> Result<Observation, BuoyError> {
    let station = row
        .get(FIELD_STATION)
        .ok_or_else(|| BuoyError::malformed("", format!("missing '{}'", FIELD_STATION)))?;
    if !is_valid_station_id(station) {
        return Err(BuoyError::malformed(station, "station id is not a valid identifier"));
    }

    let timestamp = normalized_timestamp(row, station)?;

    let location = required(row, station, FIELD_LOCATION)?;

    Ok(Observation {
        station: station.to_string(),
        timestamp,
        location: location.to_string(),
        wind_direction: measurement(row, station, "WDIR")?,
        wind_speed: measurement(row, station, "WSPD")?,
        gust_speed: measurement(row, station, "GST")?,
        wave_height: measurement(row, station, "WVHT")?,
        dom_wave_period: measurement(row, station, "DPD")?,
        avg_wave_period: measurement(row, station, "APD")?,
        dom_wave_direction: measurement(row, station, "MWD")?,
        sea_pressure: measurement(row, station, "PRES")?,
        air_temp: measurement(row, station, "ATMP")?,
        sea_surface_temp: measurement(row, station, "WTMP")?,
        dewpoint_temp: measurement(row, station, "DEWP")?,
        visibility: measurement(row, station, "VIS")?,
        pressure_tendency: measurement(row, station, "PTDY")?,
        water_level: measurement(row, station, "TIDE")?,
    })
}

/// The row's `Timestamp`, re-rendered zero-padded so stored values order
/// the same lexically and chronologically.
fn normalized_timestamp(row: &RawRow, station: &str) -> Result<String, BuoyError> {
    let raw = required(row, station, FIELD_TIMESTAMP)?;
    let parsed = parse_timestamp(raw).map_err(|e| {
        BuoyError::malformed(station, format!("timestamp '{}' is not a calendar time: {}", raw, e))
    })?;

    if !(MIN_OBSERVATION_YEAR..=MAX_OBSERVATION_YEAR).contains(&parsed.year()) {
        return Err(BuoyError::malformed(
            station,
            format!("timestamp '{}' is outside four-digit years", raw),
        ));
    }

    Ok(parsed.format(TIMESTAMP_FORMAT).to_string())
}

fn required<'a>(row: &'a RawRow, station: &str, column: &str) -> Result<&'a str, BuoyError> {
    match row.get(column) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(BuoyError::malformed(station, format!("missing '{}'", column))),
    }
}

/// Read one measurement column, mapping the sentinel to `None`.
fn measurement<T: FromStr>(
    row: &RawRow,
    station: &str,
    column: &str,
) -> Result<Option<T>, BuoyError> {
    let raw = row
        .get(column)
        .ok_or_else(|| BuoyError::malformed(station, format!("missing column '{}'", column)))?;

    if raw == MISSING_SENTINEL {
        return Ok(None);
    }

    raw.parse::<T>().map(Some).map_err(|_| {
        BuoyError::malformed(
            station,
            format!("{} value '{}' is not a {}", column, raw, std::any::type_name::<T>()),
        )
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
