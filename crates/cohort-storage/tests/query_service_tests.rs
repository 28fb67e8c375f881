use cohort_engine::{
    BitExtraction, BitField, CancelToken, CohortEngine, CohortError, CohortRequest, CohortResult,
    Column, CompiledFilter, Credentials, EngineConfig, GroupCounts, LabelRow, Record, RecordStore,
};
use cohort_storage::{QueryService, ServiceConfig, Storage};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn request() -> CohortRequest {
    CohortRequest::from_value(json!({
        "group_condition": { "group_by": "paytype", "selection": ["Medicare", "Commercial"] },
        "states": ["NJ", "NY"],
        "medical_conditions": { "OR": [3], "labels": ["c1", "c2"] }
    }))
    .unwrap()
}

fn sqlite_service(timeout: Duration) -> (Storage, QueryService<Storage>) {
    let storage = Storage::open_in_memory().unwrap();
    let records: Vec<Record> = (0..300u64)
        .map(|i| Record {
            patid: 0,
            state: if i % 2 == 0 { "NJ" } else { "NY" }.into(),
            paytyp: if i % 3 == 0 { "Medicare" } else { "Commercial" }.into(),
            pop: "Adult".into(),
            medical_condition: i % 4,
            treatment: 0,
        })
        .collect();
    storage.insert_records(&records).unwrap();
    storage
        .insert_labels(&[
            LabelRow::new(BitField::MedicalCondition, 0, "c1", "c1"),
            LabelRow::new(BitField::MedicalCondition, 1, "c2", "c2"),
        ])
        .unwrap();
    storage
        .insert_user(&Credentials::new("alice", "tok"))
        .unwrap();

    let engine = CohortEngine::new(storage.clone(), &storage, EngineConfig::default()).unwrap();
    let service = QueryService::new(
        Arc::new(engine),
        ServiceConfig {
            request_timeout: timeout,
        },
    );
    (storage, service)
}

#[tokio::test]
async fn concurrent_requests_match_a_sequential_run() {
    let (storage, service) = sqlite_service(Duration::from_secs(30));
    let expected = service
        .view(request(), BitField::MedicalCondition)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.view(request(), BitField::MedicalCondition).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), expected);
    }
    assert_eq!(storage.open_working_sets().unwrap(), 0);
}

#[tokio::test]
async fn authorized_view_consults_the_user_table() {
    let (storage, service) = sqlite_service(Duration::from_secs(30));
    let authorizer = Arc::new(storage.clone());

    let err = service
        .view_authorized(
            authorizer.clone(),
            Credentials::new("alice", "wrong"),
            request(),
            BitField::MedicalCondition,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CohortError::Unauthorized));

    let response = service
        .view_authorized(
            authorizer,
            Credentials::new("alice", "tok"),
            request(),
            BitField::MedicalCondition,
        )
        .await
        .unwrap();
    assert_eq!(response.group_condition.group_by, "paytyp");
}

/// Never finishes on its own; only cancellation ends a call.
#[derive(Debug, Default)]
struct StallingStore {
    observed_cancel: Arc<AtomicBool>,
}

impl RecordStore for StallingStore {
    fn aggregate(
        &self,
        _filter: &CompiledFilter,
        _extraction: &BitExtraction,
        cancel: &CancelToken,
    ) -> CohortResult<Vec<GroupCounts>> {
        loop {
            if let Err(err) = cancel.check() {
                self.observed_cancel.store(true, Ordering::SeqCst);
                return Err(err);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn distinct_values(&self, _column: Column) -> CohortResult<Vec<String>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn deadline_cancels_the_worker_before_returning() {
    let observed = Arc::new(AtomicBool::new(false));
    let store = StallingStore {
        observed_cancel: Arc::clone(&observed),
    };
    let labels = vec![
        LabelRow::new(BitField::MedicalCondition, 0, "c1", "c1"),
        LabelRow::new(BitField::MedicalCondition, 1, "c2", "c2"),
    ];
    let engine = CohortEngine::new(store, &labels, EngineConfig::default()).unwrap();
    let service = QueryService::new(
        Arc::new(engine),
        ServiceConfig {
            request_timeout: Duration::from_millis(20),
        },
    );

    let err = service
        .view(request(), BitField::MedicalCondition)
        .await
        .unwrap_err();
    assert!(matches!(err, CohortError::Cancelled));
    // The worker has already observed the cancellation by the time the error is returned.
    assert!(observed.load(Ordering::SeqCst));
}
