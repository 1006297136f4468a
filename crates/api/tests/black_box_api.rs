use std::sync::Arc;
use std::time::Duration;

use reportd_core::WorkerId;
use reportd_infra::producer::ReportWriter;
use reportd_infra::store::InMemoryReportStore;
use reportd_infra::worker::{TickOutcome, WorkerEngine, WorkerSettings};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    store: Arc<InMemoryReportStore>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod, backed by the in-memory store, bound to an
        // ephemeral port.
        let store = Arc::new(InMemoryReportStore::new());
        let app = reportd_api::app::build_app(store.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            store,
            handle,
        }
    }

    /// Worker engine sharing this server's store, for driving jobs to
    /// completion inside tests.
    fn worker(&self, id: &str) -> WorkerEngine {
        WorkerEngine::new(
            self.store.clone(),
            Arc::new(ReportWriter::new()),
            WorkerSettings {
                instance_id: WorkerId::from(id),
                poll_interval: Duration::from_millis(10),
                stale_lock_timeout: Duration::from_millis(300_000),
                max_attempts: 3,
            },
        )
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn usage_summary_body() -> serde_json::Value {
    json!({
        "tenant": "acme",
        "type": "USAGE_SUMMARY",
        "params": {
            "from": "2024-01-01",
            "to": "2024-01-31",
            "format": "CSV"
        }
    })
}

async fn submit(
    client: &reqwest::Client,
    base_url: &str,
    body: &serde_json::Value,
    key: Option<&str>,
) -> reqwest::Response {
    let mut request = client.post(format!("{}/reports", base_url)).json(body);
    if let Some(key) = key {
        request = request.header("Idempotency-Key", key);
    }
    request.send().await.unwrap()
}

async fn count_reports(client: &reqwest::Client, base_url: &str, tenant: &str) -> usize {
    let body: serde_json::Value = client
        .get(format!("{}/tenants/{}/reports", base_url, tenant))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["reports"].as_array().unwrap().len()
}

#[tokio::test]
async fn submit_then_fetch_roundtrip() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv.base_url, &usage_summary_body(), None).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert!(res.headers().contains_key("x-correlation-id"));

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["tenant"], "acme");
    assert_eq!(body["type"], "USAGE_SUMMARY");
    assert_eq!(body["state"], "PENDING");
    assert_eq!(body["attempts"], 0);
    assert_eq!(body["params"]["format"], "CSV");
    assert!(body.get("artifact").is_none());
    let id = body["id"].as_str().unwrap().to_string();

    let res = client
        .get(format!("{}/reports/{}", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fetched: serde_json::Value = res.json().await.unwrap();
    assert_eq!(fetched["id"], id.as_str());
}

#[tokio::test]
async fn concurrent_posts_with_same_key_converge_on_one_report() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        let base_url = srv.base_url.clone();
        handles.push(tokio::spawn(async move {
            let res = submit(&client, &base_url, &usage_summary_body(), Some("K")).await;
            let status = res.status();
            let body: serde_json::Value = res.json().await.unwrap();
            (status, body["id"].as_str().unwrap().to_string())
        }));
    }

    let mut ids = Vec::new();
    let mut created = 0;
    for handle in handles {
        let (status, id) = handle.await.unwrap();
        match status {
            StatusCode::CREATED => created += 1,
            StatusCode::OK => {}
            other => panic!("unexpected status {other}"),
        }
        ids.push(id);
    }

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 1, "all responses carry the same report id");
    assert_eq!(created, 1, "exactly one 201");
    assert_eq!(count_reports(&client, &srv.base_url, "acme").await, 1);
}

#[tokio::test]
async fn identical_submission_reuses_the_completed_report() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv.base_url, &usage_summary_body(), None).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let first: serde_json::Value = res.json().await.unwrap();
    let id = first["id"].as_str().unwrap().to_string();

    let worker = srv.worker("w-test");
    assert!(matches!(
        worker.tick().await.unwrap(),
        TickOutcome::Completed(_)
    ));

    let res = submit(&client, &srv.base_url, &usage_summary_body(), None).await;
    assert_eq!(res.status(), StatusCode::OK);
    let second: serde_json::Value = res.json().await.unwrap();
    assert_eq!(second["id"], id.as_str());
    assert_eq!(second["state"], "COMPLETED");
    assert!(second["artifact"]["checksum"].is_string());

    assert_eq!(count_reports(&client, &srv.base_url, "acme").await, 1);
}

#[tokio::test]
async fn second_key_on_identical_payload_keeps_the_first_key() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv.base_url, &usage_summary_body(), Some("K1")).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let first: serde_json::Value = res.json().await.unwrap();
    let id = first["id"].as_str().unwrap().to_string();

    srv.worker("w-test").tick().await.unwrap();

    let res = submit(&client, &srv.base_url, &usage_summary_body(), Some("K2")).await;
    assert_eq!(res.status(), StatusCode::OK);
    let second: serde_json::Value = res.json().await.unwrap();
    assert_eq!(second["id"], id.as_str());
    // The semantic hit keeps its original key.
    assert_eq!(second["idempotencyKey"], "K1");

    assert_eq!(count_reports(&client, &srv.base_url, "acme").await, 1);
}

#[tokio::test]
async fn same_key_with_different_payload_returns_the_original() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv.base_url, &usage_summary_body(), Some("K")).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let first: serde_json::Value = res.json().await.unwrap();
    let id = first["id"].as_str().unwrap().to_string();

    let mut other = usage_summary_body();
    other["params"]["to"] = json!("2024-06-30");
    let res = submit(&client, &srv.base_url, &other, Some("K")).await;
    assert_eq!(res.status(), StatusCode::OK);
    let second: serde_json::Value = res.json().await.unwrap();

    assert_eq!(second["id"], id.as_str());
    // The body reflects the first submission's payload, not the second's.
    assert_eq!(second["params"]["to"], "2024-01-31");
    assert_eq!(count_reports(&client, &srv.base_url, "acme").await, 1);
}

#[tokio::test]
async fn download_respects_the_lifecycle() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv.base_url, &usage_summary_body(), None).await;
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["id"].as_str().unwrap().to_string();

    // Not completed yet: the client must poll.
    let res = client
        .get(format!("{}/reports/{}/download", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    srv.worker("w-test").tick().await.unwrap();

    let res = client
        .get(format!("{}/reports/{}/download", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/csv"
    );
    let disposition = res
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(disposition, format!("attachment; filename=\"report-{id}\""));

    let content = res.bytes().await.unwrap();
    assert!(content.starts_with(b"metric,window_start,window_end,value"));
}

#[tokio::test]
async fn unknown_report_yields_the_canonical_error_body() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let missing = "0191d3f8-0000-7000-8000-000000000000";
    let res = client
        .get(format!("{}/reports/{}", srv.base_url, missing))
        .header("x-correlation-id", "cid-test-42")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        res.headers().get("x-correlation-id").unwrap(),
        "cid-test-42"
    );

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["statusCode"], 404);
    assert_eq!(body["path"], format!("/reports/{missing}"));
    assert_eq!(body["correlationId"], "cid-test-42");
    assert!(body["timestamp"].is_string());
    assert!(body["message"].is_string());

    // Download of an unknown report is also 404.
    let res = client
        .get(format!("{}/reports/{}/download", srv.base_url, missing))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // Unknown report type.
    let mut body = usage_summary_body();
    body["type"] = json!("QUARTERLY_FORECAST");
    let res = submit(&client, &srv.base_url, &body, None).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Unknown field in params.
    let mut body = usage_summary_body();
    body["params"]["compression"] = json!("gzip");
    let res = submit(&client, &srv.base_url, &body, None).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Inverted date range.
    let mut body = usage_summary_body();
    body["params"]["from"] = json!("2024-02-01");
    body["params"]["to"] = json!("2024-01-01");
    let res = submit(&client, &srv.base_url, &body, None).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Oversized idempotency key.
    let long_key = "k".repeat(256);
    let res = submit(&client, &srv.base_url, &usage_summary_body(), Some(&long_key)).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Unknown enum value in the list query.
    let res = client
        .get(format!("{}/tenants/acme/reports?state=SLEEPING", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Page size below the minimum.
    let res = client
        .get(format!("{}/tenants/acme/reports?limit=0", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Nothing slipped into the store.
    assert_eq!(count_reports(&client, &srv.base_url, "acme").await, 0);
}

#[tokio::test]
async fn listing_pages_and_filters() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // Three distinct submissions (different windows, so no semantic overlap).
    for month in 1..=3 {
        let mut body = usage_summary_body();
        body["params"]["from"] = json!(format!("2024-0{month}-01"));
        body["params"]["to"] = json!(format!("2024-0{month}-20"));
        let res = submit(&client, &srv.base_url, &body, None).await;
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    // Complete exactly one of them.
    assert!(matches!(
        srv.worker("w-test").tick().await.unwrap(),
        TickOutcome::Completed(_)
    ));

    // Page 1 of 2.
    let page: serde_json::Value = client
        .get(format!("{}/tenants/acme/reports?limit=2", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let reports = page["reports"].as_array().unwrap();
    assert_eq!(reports.len(), 2);
    let cursor = page["nextCursor"].as_str().expect("another page").to_string();

    // Page 2: the remainder, no further cursor.
    let page: serde_json::Value = client
        .get(format!(
            "{}/tenants/acme/reports?limit=2&cursor={}",
            srv.base_url, cursor
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["reports"].as_array().unwrap().len(), 1);
    assert!(page.get("nextCursor").is_none());

    // State filter narrows to the completed one.
    let page: serde_json::Value = client
        .get(format!(
            "{}/tenants/acme/reports?state=COMPLETED",
            srv.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["reports"].as_array().unwrap().len(), 1);
    assert_eq!(page["reports"][0]["state"], "COMPLETED");

    // Type filter matches all three; another type matches none.
    let page: serde_json::Value = client
        .get(format!(
            "{}/tenants/acme/reports?type=USAGE_SUMMARY",
            srv.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["reports"].as_array().unwrap().len(), 3);

    let page: serde_json::Value = client
        .get(format!(
            "{}/tenants/acme/reports?type=BILLING_EXPORT",
            srv.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["reports"].as_array().unwrap().len(), 0);

    // A foreign tenant sees nothing.
    assert_eq!(count_reports(&client, &srv.base_url, "globex").await, 0);
}

#[tokio::test]
async fn health_answers_ok() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}
