//! Incremental ingestion of NDBC buoy observations into per-station tables.
//!
//! The feed is fetched ([`ingest::ndbc`]), turned into typed observations
//! ([`ingest::mapper`]), and stored behind a per-station timestamp
//! watermark ([`db`]). [`pipeline::run_cycle`] ties the three together.

pub mod config;
pub mod db;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod retry;
