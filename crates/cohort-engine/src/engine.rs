//! Request entry points.
//!
//! A request flows `CohortRequest -> Criteria -> CompiledFilter -> working set -> aggregate rows ->
//! ChartSeries`. Everything except the store call is pure, and the only shared state is the
//! read-only label catalog snapshot, so any number of requests may run concurrently on one engine.
use crate::aggregate::{aggregate, BitExtraction};
use crate::auth::{Authorizer, Credentials};
use crate::backend::RecordStore;
use crate::cancel::CancelToken;
use crate::criteria::{CohortRequest, Criteria};
use crate::decode::{decode_resolved, CohortResponse};
use crate::error::{CohortError, CohortResult};
use crate::labels::{BitField, CatalogCache, Label, LabelCatalog, LabelSource, MAX_BIT_POSITIONS};
use crate::predicate::compile;
use crate::record::Column;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on a single aggregation, on top of any caller-supplied cancellation
    /// (default: none).
    pub default_query_timeout: Option<Duration>,
    /// Most labels one request may extract (default: 63, one per usable bit).
    pub max_requested_labels: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_query_timeout: None,
            max_requested_labels: MAX_BIT_POSITIONS as usize,
        }
    }
}

#[derive(Debug)]
pub struct CohortEngine<S> {
    store: S,
    catalog: CatalogCache,
    config: EngineConfig,
}

impl<S: RecordStore> CohortEngine<S> {
    /// Build an engine, loading and validating the label catalog from `labels` once.
    pub fn new(
        store: S,
        labels: &(impl LabelSource + ?Sized),
        config: EngineConfig,
    ) -> CohortResult<Self> {
        Ok(Self {
            store,
            catalog: CatalogCache::load(labels)?,
            config,
        })
    }

    pub fn with_catalog(store: S, catalog: LabelCatalog, config: EngineConfig) -> Self {
        Self {
            store,
            catalog: CatalogCache::new(catalog),
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn labels(&self) -> Arc<LabelCatalog> {
        self.catalog.snapshot()
    }

    pub fn labels_for(&self, field: BitField) -> Vec<Label> {
        self.catalog.snapshot().labels(field).to_vec()
    }

    /// Reload the catalog. Requests already running keep the snapshot they started with.
    pub fn refresh_catalog(&self, labels: &(impl LabelSource + ?Sized)) -> CohortResult<()> {
        self.catalog.refresh(labels)
    }

    pub fn distinct_values(&self, column: Column) -> CohortResult<Vec<String>> {
        self.store.distinct_values(column)
    }

    /// Filter + aggregate `field` for a raw request.
    pub fn view(
        &self,
        request: &CohortRequest,
        field: BitField,
        cancel: &CancelToken,
    ) -> CohortResult<CohortResponse> {
        let criteria = request.validate()?;
        self.view_criteria(&criteria, field, cancel)
    }

    pub fn view_medical_conditions(
        &self,
        request: &CohortRequest,
        cancel: &CancelToken,
    ) -> CohortResult<CohortResponse> {
        self.view(request, BitField::MedicalCondition, cancel)
    }

    pub fn view_treatments(
        &self,
        request: &CohortRequest,
        cancel: &CancelToken,
    ) -> CohortResult<CohortResponse> {
        self.view(request, BitField::Treatment, cancel)
    }

    /// Like [`view`](Self::view), but only after `authorizer` accepts `credentials`.
    pub fn view_authorized(
        &self,
        authorizer: &dyn Authorizer,
        credentials: &Credentials,
        request: &CohortRequest,
        field: BitField,
        cancel: &CancelToken,
    ) -> CohortResult<CohortResponse> {
        if !authorizer.is_authorized(credentials) {
            log::debug!("rejected {field} request for user {:?}", credentials.userid);
            return Err(CohortError::Unauthorized);
        }
        self.view(request, field, cancel)
    }

    /// Filter + aggregate `field` for already validated criteria.
    pub fn view_criteria(
        &self,
        criteria: &Criteria,
        field: BitField,
        cancel: &CancelToken,
    ) -> CohortResult<CohortResponse> {
        let requested = &criteria.field(field).labels;
        if requested.len() > self.config.max_requested_labels {
            return Err(CohortError::invalid(format!(
                "{} requested labels exceed the limit of {}",
                requested.len(),
                self.config.max_requested_labels
            )));
        }

        // Resolve names up front: unknown labels must fail before the store is touched.
        let catalog = self.catalog.snapshot();
        let extraction = BitExtraction::new(field, catalog.resolve(field, requested)?);

        let filter = compile(criteria);
        log::debug!(
            "{field} view grouped by {}: {}",
            filter.group_by,
            filter.row_predicate
        );

        let cancel = cancel.child(self.config.default_query_timeout);
        let rows = aggregate(&self.store, &filter, &extraction, &cancel)?;
        let series = decode_resolved(rows, extraction.labels());
        Ok(CohortResponse::new(criteria, field, series))
    }
}
