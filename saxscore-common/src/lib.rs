//! # SaxScore Common Library
//!
//! Shared code for the SaxScore services:
//! - Job, audio blob, note and export models
//! - SQLite record store (schema and queries)
//! - Job lifecycle events
//! - Configuration loading and root folder resolution

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;

pub use error::{Error, Result};
pub use models::{ExportFormat, Instrument, JobStatus};
