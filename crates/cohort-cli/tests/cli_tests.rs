use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn cohort(args: &[&str]) -> Output {
    Command::new(assert_cmd::cargo::cargo_bin!("cohort"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("spawn cohort")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "cohort failed\nstderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

fn write_json(path: &Path, value: &Value) {
    fs::write(path, serde_json::to_vec(value).unwrap()).unwrap();
}

fn dataset() -> Value {
    json!({
        "records": [
            { "state": "NJ", "paytyp": "A", "pop": "Adult", "medical_condition": 1, "treatment": 0 },
            { "state": "NJ", "paytyp": "A", "pop": "Adult", "medical_condition": 3, "treatment": 1 },
            { "state": "NY", "paytyp": "B", "pop": "Pediatric", "medical_condition": 2, "treatment": 1 }
        ],
        "labels": [
            { "name": "Condition one", "label_type": "medical_condition", "label": "c1", "label_val": 1 },
            { "name": "Condition two", "label_type": "medical_condition", "label": "c2", "label_val": 2 },
            { "name": "Treatment one", "label_type": "treatment", "label": "t1", "label_val": 1 }
        ],
        "users": [{ "userid": "alice", "authToken": "tok" }]
    })
}

fn imported_db(dir: &Path) -> String {
    let data = dir.join("data.json");
    write_json(&data, &dataset());
    let db = dir.join("cohort.sqlite");
    let db = db.to_str().unwrap().to_string();

    let summary = stdout_json(&cohort(&[
        "--db",
        &db,
        "import",
        "--input",
        data.to_str().unwrap(),
    ]));
    assert_eq!(summary, json!({ "records": 3, "labels": 3, "users": 1 }));
    db
}

#[test]
fn import_then_query_prints_the_chart_series() {
    let dir = tempfile::tempdir().unwrap();
    let db = imported_db(dir.path());

    let request = dir.path().join("request.json");
    write_json(
        &request,
        &json!({
            "group_condition": { "group_by": "paytype", "selection": ["A", "B"] },
            "states": ["NJ"],
            "medical_conditions": { "OR": [1], "labels": ["c1", "c2"] }
        }),
    );

    let response = stdout_json(&cohort(&[
        "--db",
        &db,
        "query",
        "--request",
        request.to_str().unwrap(),
        "--field",
        "medical_condition",
    ]));
    assert_eq!(
        response,
        json!({
            "group_condition": { "group_by": "paytyp", "selection": ["A", "B"] },
            "medical_conditions": {
                "labels": ["ALL_DATA", "Condition one", "Condition two"],
                "data": [
                    { "type": "A", "data": [2, 2, 1] },
                    { "type": "B", "data": [0, 0, 0] }
                ]
            }
        })
    );
}

#[test]
fn labels_and_values_list_reference_data() {
    let dir = tempfile::tempdir().unwrap();
    let db = imported_db(dir.path());

    let labels = stdout_json(&cohort(&["--db", &db, "labels", "--field", "treatment"]));
    assert_eq!(
        labels,
        json!({
            "treatments": [
                { "label_type": "treatment", "position": 0, "label": "t1", "name": "Treatment one" }
            ]
        })
    );

    let values = stdout_json(&cohort(&["--db", &db, "values", "paytype"]));
    assert_eq!(values, json!(["A", "B"]));
}

#[test]
fn config_file_supplies_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = imported_db(dir.path());
    let config = dir.path().join("config.json");
    write_json(&config, &json!({ "database": db, "request_timeout_ms": 5000 }));

    let values = stdout_json(&cohort(&[
        "--config",
        config.to_str().unwrap(),
        "values",
        "state",
    ]));
    assert_eq!(values, json!(["NJ", "NY"]));
}

#[test]
fn invalid_requests_fail_with_a_message() {
    let dir = tempfile::tempdir().unwrap();
    let db = imported_db(dir.path());
    let request = dir.path().join("request.json");
    write_json(
        &request,
        &json!({
            "group_condition": { "group_by": "region", "selection": ["A"] },
            "states": ["NJ"]
        }),
    );

    let output = cohort(&["--db", &db, "query", "--request", request.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid_criteria"), "stderr:\n{stderr}");
    assert!(stderr.contains("unknown group_by dimension"), "stderr:\n{stderr}");
}

#[test]
fn wrong_credentials_are_unauthorized() {
    let dir = tempfile::tempdir().unwrap();
    let db = imported_db(dir.path());
    let request = dir.path().join("request.json");
    write_json(
        &request,
        &json!({
            "group_condition": { "group_by": "pop", "selection": ["Adult"] },
            "states": ["NJ"]
        }),
    );
    let request = request.to_str().unwrap();

    let output = cohort(&[
        "--db", &db, "query", "--request", request, "--userid", "alice", "--auth-token", "nope",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unauthorized"));

    let response = stdout_json(&cohort(&[
        "--db", &db, "query", "--request", request, "--userid", "alice", "--auth-token", "tok",
    ]));
    assert_eq!(
        response["medical_conditions"]["data"],
        json!([{ "type": "Adult", "data": [2] }])
    );
}

#[test]
fn missing_database_is_reported() {
    let output = cohort(&["values", "state"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no database given"));
}
