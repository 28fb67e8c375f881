//! Cohort analysis over bitmask-encoded categorical attributes.
//!
//! Records carry two bit-fields (medical conditions and treatments) where each bit marks
//! membership in one labeled category. The engine answers "count records per group, broken down
//! by a chosen set of labels, restricted by states, a group selection and AND/OR bit constraints"
//! and returns the counts in a chart-ready shape.
//!
//! Storage is pluggable through [`RecordStore`]; [`InMemoryRecordStore`] ships with this crate and
//! `cohort-storage` provides a SQLite implementation.

mod aggregate;
mod auth;
mod backend;
mod cancel;
mod criteria;
mod decode;
mod engine;
mod error;
mod labels;
mod predicate;
mod record;

pub use crate::aggregate::{aggregate, AggregateRow, BitExtraction, GroupCounts};
pub use crate::auth::{Authorizer, Credentials};
pub use crate::backend::{InMemoryRecordStore, RecordStore};
pub use crate::cancel::CancelToken;
pub use crate::criteria::{
    BitConstraint, BitFieldRequest, CohortRequest, Criteria, Dimension, FieldCriteria,
    GroupCondition, GroupConditionRequest, MAX_MASK,
};
pub use crate::decode::{
    decode, decode_resolved, ChartSeries, CohortResponse, GroupConditionEcho, SeriesEntry,
    ALL_DATA,
};
pub use crate::engine::{CohortEngine, EngineConfig};
pub use crate::error::{CohortError, CohortResult, ErrorCategory};
pub use crate::labels::{
    BitField, CatalogCache, Label, LabelCatalog, LabelRow, LabelSource, MAX_BIT_POSITIONS,
};
pub use crate::predicate::{compile, CompiledFilter, Predicate};
pub use crate::record::{Column, Record};
