//! HTTP surface tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use shotlist_analyzer::{Analyzer, AnalyzerResult};
use shotlist_api::{create_router, ApiConfig, AppState};
use shotlist_models::{Job, Shot};
use shotlist_queue::{JobQueue, ProgressStore, QueueConfig};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};
use tower::ServiceExt;

/// Detects one shot; description waits for a permit.
struct GatedAnalyzer {
    gate: Arc<Semaphore>,
    describing: Notify,
}

#[async_trait]
impl Analyzer for GatedAnalyzer {
    async fn detect(&self, job: &Job) -> AnalyzerResult<Vec<Shot>> {
        Ok(vec![Shot::new(
            1.5,
            format!("/uploads/scenes/{}/scene-001.jpg", job.id),
        )])
    }

    async fn describe_and_finalize(&self, _record_path: &Path) -> AnalyzerResult<()> {
        self.describing.notify_one();
        let _permit = self.gate.acquire().await.unwrap();
        Ok(())
    }
}

struct TestApp {
    router: Router,
    queue: JobQueue,
    analyzer: Arc<GatedAnalyzer>,
    _dir: TempDir,
}

fn test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let analyzer = Arc::new(GatedAnalyzer {
        gate: Arc::new(Semaphore::new(0)),
        describing: Notify::new(),
    });
    let store = ProgressStore::new(QueueConfig::with_data_dir(dir.path()));
    let queue = JobQueue::new(store, analyzer.clone());
    let state = AppState::new(ApiConfig::default(), queue.clone());
    TestApp {
        router: create_router(state, None),
        queue,
        analyzer,
        _dir: dir,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = test_app();
    let (status, body) = send(&app.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_readiness_follows_queue_lifecycle() {
    let app = test_app();

    let (status, body) = send(&app.router, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not_ready");

    app.queue.start().await.unwrap();
    let (status, body) = send(&app.router, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pendingJobs"], 0);

    app.queue.shutdown(Duration::from_secs(1)).await;
    let (status, _) = send(&app.router, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = test_app();
    let request = Request::builder()
        .uri("/health")
        .header("X-Request-ID", "req-42")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.headers()["X-Request-ID"], "req-42");
}

#[tokio::test]
async fn test_metrics_route_absent_without_handle() {
    let app = test_app();
    let (status, _) = send(&app.router, get("/metrics")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_submit_is_idempotent_while_waiting() {
    // Runner not started, so jobs stay in the FIFO.
    let app = test_app();
    let submit = json!({"jobId": "clip-1", "inputPath": "/videos/clip-1.mp4"});

    let (status, body) = send(&app.router, with_json("POST", "/api/jobs", submit.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"jobId": "clip-1", "accepted": true}));

    let (status, body) = send(&app.router, with_json("POST", "/api/jobs", submit)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], false);

    let (_, body) = send(&app.router, get("/api/queue")).await;
    assert_eq!(body, json!({"active": null, "pending": ["clip-1"]}));
}

#[tokio::test]
async fn test_submit_generates_id() {
    let app = test_app();
    let (status, body) = send(
        &app.router,
        with_json("POST", "/api/jobs", json!({"inputPath": "/videos/a.mp4"})),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["jobId"].as_str().unwrap();
    assert!(!id.is_empty());

    let (_, body) = send(&app.router, get(&format!("/api/jobs/{}", id))).await;
    assert_eq!(body["status"], "submitted");
    assert_eq!(body["queuePosition"], 0);
}

#[tokio::test]
async fn test_submit_rejects_bad_input() {
    let app = test_app();
    let cases = [
        json!({"jobId": "a", "inputPath": "  "}),
        json!({"jobId": "a", "inputPath": "/videos/a|b.mp4"}),
        json!({"jobId": "../escape", "inputPath": "/videos/a.mp4"}),
    ];
    for body in cases {
        let (status, body) = send(&app.router, with_json("POST", "/api/jobs", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
        assert!(body["detail"].is_string());
    }
    assert!(app.queue.snapshot().await.pending.is_empty());
}

#[tokio::test]
async fn test_status_of_unknown_job() {
    let app = test_app();

    let (status, body) = send(&app.router, get("/api/jobs/never-seen")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"jobId": "never-seen", "status": "not_started"}));

    let (status, _) = send(&app.router, get("/api/jobs/not.valid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_annotate() {
    let app = test_app();

    let patch = json!({"videoTitle": "Harbour at dusk"});
    let (status, _) = send(&app.router, with_json("PATCH", "/api/jobs/nobody", patch.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(
        &app.router,
        with_json("POST", "/api/jobs", json!({"jobId": "harbour", "inputPath": "/v/h.mp4"})),
    )
    .await;

    let (status, body) = send(&app.router, with_json("PATCH", "/api/jobs/harbour", patch)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["videoTitle"], "Harbour at dusk");
    assert_eq!(body["status"], "submitted");

    let (status, _) = send(&app.router, with_json("PATCH", "/api/jobs/harbour", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_unknown_and_waiting() {
    let app = test_app();

    let (status, _) = send(&app.router, delete("/api/jobs/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(
        &app.router,
        with_json("POST", "/api/jobs", json!({"jobId": "waiting", "inputPath": "/v/w.mp4"})),
    )
    .await;
    let (status, body) = send(&app.router, delete("/api/jobs/waiting")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "job_in_progress");
}

#[tokio::test]
async fn test_job_lifecycle_over_http() {
    let app = test_app();
    tokio_test::assert_ok!(app.queue.start().await);

    let describing = app.analyzer.describing.notified();
    send(
        &app.router,
        with_json("POST", "/api/jobs", json!({"jobId": "reel", "inputPath": "/v/reel.mp4"})),
    )
    .await;
    tokio::time::timeout(Duration::from_secs(5), describing)
        .await
        .expect("description never started");

    let (_, body) = send(&app.router, get("/api/jobs/reel")).await;
    assert_eq!(body["status"], "analyzing");
    assert_eq!(body["sceneCount"], 1);

    let (_, body) = send(&app.router, get("/api/queue")).await;
    assert_eq!(body["active"], "reel");

    let (status, _) = send(&app.router, delete("/api/jobs/reel")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    app.analyzer.gate.add_permits(1);
    let done = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (_, body) = send(&app.router, get("/api/jobs/reel")).await;
            if body["status"] == "complete" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not complete");
    assert_eq!(done["reportReady"], true);
    assert_eq!(done["scenes"][0]["timecode"], "00:00:01.500");

    let (status, _) = send(&app.router, delete("/api/jobs/reel")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app.router, get("/api/jobs/reel")).await;
    assert_eq!(body["status"], "not_started");

    app.queue.shutdown(Duration::from_secs(1)).await;
}
