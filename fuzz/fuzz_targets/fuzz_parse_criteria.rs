#![no_main]

use cohort_engine::{compile, CohortRequest, Record};
use libfuzzer_sys::fuzz_target;

/// Requests are small JSON documents; keep the harness from spending time on huge inputs.
const MAX_INPUT_BYTES: usize = 16 * 1024;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > MAX_INPUT_BYTES {
        return;
    }
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let Ok(request) = CohortRequest::from_json(text) else {
        return;
    };
    let Ok(criteria) = request.validate() else {
        return;
    };

    let filter = compile(&criteria);
    assert_eq!(filter.selection, criteria.group.selection);

    // A record built from the first selected values must pass the text part of the filter
    // whenever the bit constraints are satisfiable by an all-ones mask.
    let record = Record {
        patid: 0,
        state: criteria.states[0].clone(),
        paytyp: criteria.group.selection[0].clone(),
        pop: criteria.group.selection[0].clone(),
        medical_condition: cohort_engine::MAX_MASK,
        treatment: cohort_engine::MAX_MASK,
    };
    assert!(filter.row_predicate.evaluate(&record));
    let _ = filter.row_predicate.to_string();
});
