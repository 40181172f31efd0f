//! ClimaStation Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the ClimaStation ingest
//! workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`ClimaError`] and the crate [`Result`] alias
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Manifest**: the JSON Lines file list produced by a repository crawl,
//!   plus the downstream integrity validator
//!
//! # Example
//!
//! ```no_run
//! use clima_common::manifest::{read_manifest, validate_manifest};
//! use clima_common::Result;
//!
//! fn check(path: &str) -> Result<()> {
//!     let report = validate_manifest(path)?;
//!     report.into_result()?;
//!     let records = read_manifest(path)?;
//!     tracing::info!(records = records.len(), "Manifest is valid");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod fs;
pub mod logging;
pub mod manifest;

// Re-export commonly used types
pub use error::{ClimaError, Result};
