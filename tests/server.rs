//! HTTP server round trips over a real listener.

use serde_json::{json, Value};
use std::sync::Arc;

use parcel_harvest::server::router;
use parcel_harvest::{Collector, CollectorSettings};

async fn spawn_server() -> (String, Arc<Collector>) {
    let collector = Arc::new(
        Collector::builder(CollectorSettings {
            workers: 1,
            ..CollectorSettings::default()
        })
        .build(),
    );
    let app = router(collector.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), collector)
}

#[tokio::test]
async fn health_lists_adapters() {
    let (base, _collector) = spawn_server().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["adapters"], json!(["local_synthesis"]));
    assert_eq!(body["queued"], 0);
}

#[tokio::test]
async fn collect_returns_the_record() {
    let (base, _collector) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/collect", base))
        .json(&json!({ "input": "501 38 237", "priority": "high", "wait_secs": 10 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["cached"], false);
    assert!(body["job_id"].is_string());
    assert_eq!(body["record"]["key"]["normalized_value"], "50138237");
    assert_eq!(body["record"]["completeness"], "basic");

    // Placeholders are never fresh.
    let resp = client
        .get(format!("{}/cached", base))
        .query(&[("input", "50138237")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .delete(format!("{}/cached", base))
        .query(&[("input", "501-38-237")])
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["key"], "apn:50138237");
    assert_eq!(body["removed"], true);
}

#[tokio::test]
async fn bad_input_uses_the_error_envelope() {
    let (base, _collector) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/collect", base))
        .json(&json!({ "input": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("invalid input"));

    let resp = client
        .post(format!("{}/collect", base))
        .json(&json!({ "input": "50138237", "kind": "zipcode" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn queue_is_empty_when_idle() {
    let (base, _collector) = spawn_server().await;
    let body: Value = reqwest::get(format!("{}/queue", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!([]));
}
