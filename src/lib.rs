//! Terminal inspector for model evaluation Parquet files.
//!
//! The ingestion pipeline lives in the `lens` crate; this crate adds layered
//! configuration and the text/PNG presentation used by the binaries.

pub mod config;
pub mod report;
