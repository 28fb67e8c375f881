//! SQLite-backed record storage for the cohort engine.
//!
//! Exposes:
//! - schema creation for the record, label and user tables
//! - bulk import of records, labels and users
//! - a [`cohort_engine::RecordStore`] that filters into a request-scoped temp table and
//!   aggregates it with bound parameters only
//! - [`cohort_engine::LabelSource`] and [`cohort_engine::Authorizer`] implementations
//! - an async [`QueryService`] with per-request deadlines

mod schema;
mod service;
mod sql;
pub mod storage;
mod working_set;

pub use service::{QueryService, ServiceConfig};
pub use storage::{Dataset, ImportSummary, Storage, StorageConfig, StorageError};
