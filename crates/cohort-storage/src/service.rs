use crate::storage::StorageError;
use cohort_engine::{
    Authorizer, BitField, CancelToken, CohortEngine, CohortError, CohortRequest, CohortResponse,
    CohortResult, Credentials, RecordStore,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deadline for a single request, including time spent waiting for the store (default: 30s).
    pub request_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Async front of a [`CohortEngine`].
///
/// Each request runs on the blocking pool. When the deadline passes, or the returned future is
/// dropped, the request's token is tripped; on timeout the service waits for the worker to wind
/// down so its working set is gone before the error is reported.
#[derive(Debug)]
pub struct QueryService<S> {
    engine: Arc<CohortEngine<S>>,
    config: ServiceConfig,
}

impl<S> Clone for QueryService<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            config: self.config.clone(),
        }
    }
}

impl<S: RecordStore + 'static> QueryService<S> {
    pub fn new(engine: Arc<CohortEngine<S>>, config: ServiceConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<CohortEngine<S>> {
        &self.engine
    }

    pub async fn view(&self, request: CohortRequest, field: BitField) -> CohortResult<CohortResponse> {
        self.run(move |engine, cancel| engine.view(&request, field, cancel))
            .await
    }

    pub async fn view_authorized(
        &self,
        authorizer: Arc<dyn Authorizer>,
        credentials: Credentials,
        request: CohortRequest,
        field: BitField,
    ) -> CohortResult<CohortResponse> {
        self.run(move |engine, cancel| {
            engine.view_authorized(&*authorizer, &credentials, &request, field, cancel)
        })
        .await
    }

    async fn run<F>(&self, work: F) -> CohortResult<CohortResponse>
    where
        F: FnOnce(&CohortEngine<S>, &CancelToken) -> CohortResult<CohortResponse> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let _cancel_on_drop = CancelOnDrop(cancel.clone());

        let engine = Arc::clone(&self.engine);
        let token = cancel.clone();
        let mut worker = tokio::task::spawn_blocking(move || work(&engine, &token));

        match tokio::time::timeout(self.config.request_timeout, &mut worker).await {
            Ok(joined) => joined.map_err(|err| StorageError::WorkerFailed(err.to_string()))?,
            Err(_) => {
                log::warn!(
                    "request exceeded {:?}, cancelling",
                    self.config.request_timeout
                );
                cancel.cancel();
                if let Err(err) = worker.await {
                    log::warn!("query worker failed after cancellation: {err}");
                }
                Err(CohortError::Cancelled)
            }
        }
    }
}

/// Trips the token when the request future goes away.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
