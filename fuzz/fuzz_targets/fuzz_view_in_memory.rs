#![no_main]

use cohort_engine::{
    BitField, CancelToken, CohortEngine, CohortRequest, EngineConfig, InMemoryRecordStore,
    LabelRow, Record,
};
use libfuzzer_sys::fuzz_target;

const MAX_INPUT_BYTES: usize = 16 * 1024;
const STATES: [&str; 3] = ["NJ", "NY", "PA"];
const PAYERS: [&str; 3] = ["Commercial", "Medicare", "Medicaid"];

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 || data.len() > MAX_INPUT_BYTES {
        return;
    }

    // First byte sizes the record set, the rest is the request.
    let rows = usize::from(data[0]);
    let Ok(text) = std::str::from_utf8(&data[1..]) else {
        return;
    };
    let Ok(request) = CohortRequest::from_json(text) else {
        return;
    };

    let mut store = InMemoryRecordStore::new();
    for i in 0..rows {
        let mixed = (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        store.push(Record {
            patid: i as i64,
            state: STATES[i % STATES.len()].to_string(),
            paytyp: PAYERS[i % PAYERS.len()].to_string(),
            pop: "Adult".to_string(),
            medical_condition: mixed & 0xFF,
            treatment: (mixed >> 8) & 0xFF,
        });
    }
    let labels: Vec<LabelRow> = BitField::ALL
        .into_iter()
        .flat_map(|field| {
            (0..8u32).map(move |bit| {
                let key = format!("{}{bit}", &field.label_type()[..1]);
                LabelRow::new(field, bit, &key, &key)
            })
        })
        .collect();
    let Ok(engine) = CohortEngine::new(store, &labels, EngineConfig::default()) else {
        return;
    };

    for field in BitField::ALL {
        let Ok(response) = engine.view(&request, field, &CancelToken::new()) else {
            continue;
        };
        let series = response.series(field).expect("series for the queried field");
        for entry in &series.data {
            assert_eq!(entry.data.len(), series.labels.len());
            // No label count can exceed its group's total.
            assert!(entry.data[1..].iter().all(|&count| count <= entry.data[0]));
        }
    }
});
