use serde_json::{json, Value};
use std::io::Read;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use study_core::{ParticipantInfo, ResultSet, TrialResult};
use study_store::{HttpStore, ResultStore, StoreError};

struct ReceivedRequest {
    url: String,
    authorization: Option<String>,
    body: Value,
}

/// Serves one response per entry in `statuses`, reporting each request back
/// over a channel, then shuts down.
fn spawn_stub_store(statuses: Vec<u16>) -> (String, mpsc::Receiver<ReceivedRequest>) {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("bind stub store");
    let addr = server.server_addr().to_ip().expect("stub store ip");
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for status in statuses {
            let mut request = match server.recv() {
                Ok(r) => r,
                Err(_) => return,
            };
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let authorization = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Authorization"))
                .map(|h| h.value.as_str().to_string());
            let received = ReceivedRequest {
                url: request.url().to_string(),
                authorization,
                body: serde_json::from_str(&body).unwrap_or(Value::Null),
            };
            let _ = tx.send(received);
            let _ = request.respond(tiny_http::Response::empty(tiny_http::StatusCode(status)));
        }
    });
    (format!("http://{}", addr), rx)
}

fn participant() -> ParticipantInfo {
    ParticipantInfo::new("p1", "marbles-implicature", "s1")
}

fn record(index: u64) -> TrialResult {
    let mut record = TrialResult::new();
    record.set("task", json!("passage_estimate"));
    record.set("trial_index", json!(index));
    record
}

#[test]
fn save_one_posts_record_with_participant() {
    let (base, rx) = spawn_stub_store(vec![200]);
    let store = HttpStore::new(&base, participant()).expect("build store");

    store.save_one(&record(2)).expect("save_one succeeds");

    let received = rx.recv_timeout(Duration::from_secs(5)).expect("request seen");
    assert_eq!(received.url, "/trials");
    assert_eq!(received.body["participant"]["participant_id"], "p1");
    assert_eq!(received.body["record"]["task"], "passage_estimate");
    assert_eq!(received.body["record"]["trial_index"], 2);
    assert!(received.body["recorded_at"].is_string());
}

#[test]
fn save_all_posts_ordered_records() {
    let (base, rx) = spawn_stub_store(vec![200]);
    let store = HttpStore::new(&base, participant()).expect("build store");

    let mut set = ResultSet::new();
    set.push(record(0));
    set.push(record(1));
    store.save_all(&set).expect("save_all succeeds");

    let received = rx.recv_timeout(Duration::from_secs(5)).expect("request seen");
    assert_eq!(received.url, "/sessions");
    assert_eq!(received.body["record_count"], 2);
    let records = received.body["records"].as_array().expect("records array");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["trial_index"], 0);
    assert_eq!(records[1]["trial_index"], 1);
    assert!(received.body["completed_at"].is_string());
}

#[test]
fn rejected_status_surfaces_as_error() {
    let (base, rx) = spawn_stub_store(vec![500]);
    let store = HttpStore::new(&base, participant()).expect("build store");

    let err = store.save_one(&record(0)).expect_err("save_one must fail");
    match err {
        StoreError::Rejected { status } => assert_eq!(status, 500),
        other => panic!("expected rejected error, got {}", other),
    }
    let _ = rx.recv_timeout(Duration::from_secs(5)).expect("request seen");
}

#[test]
fn unreachable_endpoint_is_a_transport_error() {
    let store = HttpStore::new("http://127.0.0.1:9", participant()).expect("build store");
    let err = store.save_all(&ResultSet::new()).expect_err("must fail");
    assert!(matches!(err, StoreError::Transport(_)), "got {}", err);
}

#[test]
fn bearer_token_attaches_from_named_env_var() {
    let (base, rx) = spawn_stub_store(vec![200]);
    std::env::set_var("STUDY_STORE_TEST_TOKEN", "tok-123");
    let store = HttpStore::new(&base, participant())
        .expect("build store")
        .with_token_env("STUDY_STORE_TEST_TOKEN");

    store.save_one(&record(0)).expect("save_one succeeds");

    let received = rx.recv_timeout(Duration::from_secs(5)).expect("request seen");
    assert_eq!(received.authorization.as_deref(), Some("Bearer tok-123"));
}
