use flowlog_adapters::{
    adapter_for_source, transform_raw_to_common, FlowState, SourceKind, SourceSettings,
};
use flowlog_core::{parse_source_timestamp, CommonRecord};
use serde_json::{json, Value};

fn settings(url: &str) -> SourceSettings {
    SourceSettings {
        url: url.to_string(),
        project: "ACME".to_string(),
        auth_policy: "key:token".to_string(),
        user_data: "k:t".to_string(),
        severity: vec!["High".to_string()],
        flow: vec![
            FlowState { name: "Backlog".to_string() },
            FlowState { name: "Done".to_string() },
        ],
        ..Default::default()
    }
}

fn jira_issue(id: &str, histories: Value) -> Value {
    json!({
        "id": id,
        "self": format!("https://tracker.example.test/rest/api/2/issue/{id}"),
        "fields": { "created": "2024-02-01T09:00:00.000+0100", "priority": { "name": "Major" } },
        "changelog": { "histories": histories }
    })
}

fn jira_batch() -> Vec<Value> {
    vec![
        jira_issue("1", json!([])),
        jira_issue(
            "2",
            json!([
                { "created": "2024-02-02T09:00:00.000+0100", "items": [{ "field": "status", "fromString": "Open", "toString": "In Progress" }] },
                { "created": "2024-02-03T09:00:00.000+0100", "items": [{ "field": "priority", "fromString": "Medium", "toString": "Critical" }] },
                { "created": "2024-02-04T09:00:00.000+0100", "items": [{ "field": "resolution", "fromString": null, "toString": "Done" }] },
                { "created": "2024-02-05T09:00:00.000+0100", "items": [{ "field": "resolution", "fromString": "Done", "toString": null }] },
                { "created": "2024-02-06T09:00:00.000+0100", "items": [{ "field": "Fix Version", "fromString": null, "toString": "1.2" }] }
            ]),
        ),
    ]
}

fn trello_batch() -> Vec<Value> {
    vec![json!({
        "id": "65b9e3000000000000000000",
        "shortUrl": "https://board.example.test/c/x1",
        "dateLastActivity": "2024-02-10T00:00:00.000Z",
        "actions": [
            { "date": "2024-02-08T00:00:00.000Z", "data": { "listBefore": { "name": "Doing" }, "listAfter": { "name": "Done" } } },
            { "date": "2024-02-06T00:00:00.000Z", "data": { "list": { "name": "Doing" } } },
            { "date": "2024-02-05T00:00:00.000Z", "data": { "listBefore": { "name": "Todo" }, "listAfter": { "name": "Doing" } } },
            { "date": "2024-01-31T06:04:48.000Z", "data": { "list": { "name": "Todo" } } }
        ]
    })]
}

fn assert_gap_free(records: &[CommonRecord], created: &[&str]) {
    assert_eq!(records.len(), created.len());
    for (record, created) in records.iter().zip(created) {
        let created = parse_source_timestamp(created).expect("creation timestamp");
        match record {
            CommonRecord::Defect(entry) => entry.check_continuity(created).unwrap(),
            CommonRecord::Demand(entry) => entry.check_continuity(created).unwrap(),
        }
    }
}

#[test]
fn every_source_produces_gap_free_history() {
    let cases = [
        (SourceKind::JiraDefect, "https://tracker.example.test/rest/api/2/", jira_batch()),
        (SourceKind::JiraDemand, "https://tracker.example.test/rest/api/2/", jira_batch()),
        (SourceKind::TrelloDemand, "https://board.example.test/1/boards/b1", trello_batch()),
    ];

    for (kind, url, raw) in cases {
        let adapter = adapter_for_source(kind, settings(url)).unwrap();
        let shaped: Vec<Value> = raw.into_iter().map(|item| adapter.shape(item)).collect();
        let records = transform_raw_to_common(adapter.as_ref(), &shaped).unwrap();

        let created: Vec<&str> = match kind {
            SourceKind::TrelloDemand => vec!["2024-01-31T06:04:48Z"],
            _ => vec!["2024-02-01T08:00:00Z", "2024-02-01T08:00:00Z"],
        };
        assert_gap_free(&records, &created);

        let again = transform_raw_to_common(adapter.as_ref(), &shaped).unwrap();
        assert_eq!(records, again, "reconstruction must be idempotent for {kind:?}");
    }
}

#[test]
fn demand_history_from_issue_tracker_matches_expected_states() {
    let adapter = adapter_for_source(
        SourceKind::JiraDemand,
        settings("https://tracker.example.test/rest/api/2/"),
    )
    .unwrap();
    let shaped: Vec<Value> = jira_batch().into_iter().map(|i| adapter.shape(i)).collect();
    let records = transform_raw_to_common(adapter.as_ref(), &shaped).unwrap();

    let CommonRecord::Demand(entry) = &records[1] else {
        panic!("expected demand record");
    };
    let states: Vec<&str> = entry.history.iter().map(|h| h.status_value.as_str()).collect();
    assert_eq!(
        states,
        vec!["Backlog", "In Progress", "Done", "In Progress", "Fix Version-1.2"]
    );
    let lifecycle: Vec<&str> = entry
        .history
        .iter()
        .filter(|h| !h.is_release_marker())
        .map(|h| h.status_value.as_str())
        .collect();
    assert_eq!(lifecycle, vec!["Backlog", "In Progress", "Done", "In Progress"]);
}

#[test]
fn defect_history_tracks_priority_dimension() {
    let adapter = adapter_for_source(
        SourceKind::JiraDefect,
        settings("https://tracker.example.test/rest/api/2/"),
    )
    .unwrap();
    let shaped: Vec<Value> = jira_batch().into_iter().map(|i| adapter.shape(i)).collect();
    let records = transform_raw_to_common(adapter.as_ref(), &shaped).unwrap();

    let CommonRecord::Defect(untouched) = &records[0] else {
        panic!("expected defect record");
    };
    assert_eq!(untouched.history.len(), 1);
    assert_eq!(untouched.history[0].priority_value, "Major");
    assert_eq!(untouched.history[0].status_value, "CREATED");

    let CommonRecord::Defect(entry) = &records[1] else {
        panic!("expected defect record");
    };
    let rows: Vec<(&str, &str)> = entry
        .history
        .iter()
        .map(|h| (h.priority_value.as_str(), h.status_value.as_str()))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("Medium", "CREATED"),
            ("Medium", "In Progress"),
            ("Critical", "In Progress"),
        ]
    );
}
