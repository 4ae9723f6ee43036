use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use hasty_api::app::{build_app, services::AppServices};
use hasty_events::{EventBus, InMemoryEventBus, JobEventPublisher};
use hasty_infra::AdmissionGuard;
use hasty_infra::config::AppConfig;
use hasty_infra::jobs::{InMemoryJobStore, JobStore};
use hasty_infra::workers::{LifecycleOrchestrator, LifecycleWorker, WorkFn, simulate_work, work_fn};
use hasty_jobs::{JobOutcome, JobStatus, SleepPolicy, Subject};

struct TestServer {
    base_url: String,
    store: Arc<InMemoryJobStore>,
    bus: Arc<InMemoryEventBus>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let cfg = AppConfig::default();
        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryEventBus::new());
        let dyn_store: Arc<dyn JobStore> = store.clone();
        let dyn_bus: Arc<dyn EventBus> = bus.clone();
        let services = AppServices {
            guard: AdmissionGuard::new(Arc::clone(&dyn_store), cfg.admission_rules()),
            publisher: JobEventPublisher::new(Arc::clone(&dyn_bus)),
            store: dyn_store,
            bus: dyn_bus,
            request_timeout: cfg.request_timeout(),
            publish_retry: cfg.publish_retry(),
        };

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(Arc::new(services));
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
            bus,
            handle,
        }
    }

    /// Run a lifecycle worker against the server's store and bus.
    async fn start_worker(&self, work: WorkFn, token: CancellationToken) -> LifecycleWorker {
        let cfg = AppConfig::default();
        let sleep = SleepPolicy::new(1, 2, Duration::from_secs(3)).unwrap();
        let orchestrator = Arc::new(
            LifecycleOrchestrator::new(
                Arc::clone(&self.store),
                JobEventPublisher::new(Arc::clone(&self.bus)),
                sleep,
            )
            .with_work(work),
        );
        LifecycleWorker::start(Arc::clone(&self.bus), orchestrator, cfg.worker_config(), token)
            .await
            .unwrap()
    }

    async fn create(&self, client: &reqwest::Client, object_id: &str) -> reqwest::Response {
        client
            .post(format!("{}/", self.base_url))
            .json(&json!({ "object_id": object_id }))
            .send()
            .await
            .unwrap()
    }

    async fn created_job_id(&self, client: &reqwest::Client, object_id: &str) -> String {
        let res = self.create(client, object_id).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: Value = res.json().await.unwrap();
        body["job_id"].as_str().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn get_job(client: &reqwest::Client, base_url: &str, id: &str) -> (StatusCode, Value) {
    let res = client
        .get(format!("{}/{}", base_url, id))
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn job_eventually(
    client: &reqwest::Client,
    base_url: &str,
    id: &str,
    done: impl Fn(&Value) -> bool,
) -> Value {
    // Processing is asynchronous; poll until the worker's write is visible.
    for _ in 0..100 {
        let (status, body) = get_job(client, base_url, id).await;
        assert_eq!(status, StatusCode::OK);
        if done(&body) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {id} did not reach the expected state within timeout");
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_then_get_returns_processing_job() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let id = srv.created_job_id(&client, "X").await;
    let (status, body) = get_job(&client, &srv.base_url, &id).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], id);
    assert_eq!(body["object_id"], "X");
    assert_eq!(body["status"], "processing");
    assert!(body["timestamp"].is_i64());

    assert_eq!(srv.bus.published(Subject::Created.as_str()).len(), 1);
}

#[tokio::test]
async fn second_create_inside_cooldown_is_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    srv.created_job_id(&client, "X").await;
    let res = srv.create(&client, "X").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"], "5 minutes not passed yet");

    assert_eq!(srv.bus.published(Subject::Created.as_str()).len(), 1);
    assert_eq!(srv.store.len(), 1);
}

#[tokio::test]
async fn malformed_create_bodies_are_bad_requests() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/", srv.base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert!(body["message"].is_string());

    let res = srv.create(&client, "   ").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(srv.store.is_empty());
}

#[tokio::test]
async fn unknown_job_id_is_bad_request_naming_the_id() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let unknown = uuid::Uuid::now_v7().to_string();
    let (status, body) = get_job(&client, &srv.base_url, &unknown).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains(&unknown));

    let (status, body) = get_job(&client, &srv.base_url, "not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("not-a-uuid"));
}

#[tokio::test]
async fn cancel_publishes_request_for_live_job_and_conflicts_once_terminal() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let id = srv.created_job_id(&client, "C").await;
    let res = client
        .post(format!("{}/{}/cancel", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert_eq!(srv.bus.published(Subject::CancelRequested.as_str()).len(), 1);

    srv.store
        .complete(id.parse().unwrap(), JobOutcome::Finished, 20)
        .await
        .unwrap();
    let res = client
        .post(format!("{}/{}/cancel", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let unknown = uuid::Uuid::now_v7().to_string();
    let res = client
        .post(format!("{}/{}/cancel", srv.base_url, unknown))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn publish_failure_asks_caller_to_rerun() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    srv.bus.close().await.unwrap();
    let res = srv.create(&client, "P").await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"], "please rerun the job");
}

#[tokio::test]
async fn job_runs_to_finished_through_a_worker() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = CancellationToken::new();
    let worker = srv.start_worker(work_fn(simulate_work), token.clone()).await;

    let id = srv.created_job_id(&client, "Y").await;
    let body = job_eventually(&client, &srv.base_url, &id, |b| b["status"] == "finished").await;
    assert_eq!(body["sleep_time_used"], 1);
    assert_eq!(srv.bus.published(Subject::Finished.as_str()).len(), 1);

    worker.shutdown().await;
}

#[tokio::test]
async fn cancel_endpoint_cancels_running_job() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = CancellationToken::new();
    let until_cancelled = work_fn(|_, token: CancellationToken| async move {
        token.cancelled().await;
        JobOutcome::Cancelled
    });
    let worker = srv.start_worker(until_cancelled, token.clone()).await;

    let id = srv.created_job_id(&client, "K").await;
    job_eventually(&client, &srv.base_url, &id, |b| b["sleep_time_used"].is_u64()).await;
    // Registration follows the sleep write; give the worker a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let res = client
        .post(format!("{}/{}/cancel", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let body = job_eventually(&client, &srv.base_url, &id, |b| b["status"] == "cancelled").await;
    assert_eq!(body["status"], "cancelled");
    assert_eq!(
        srv.store
            .find_by_job_id(id.parse().unwrap())
            .await
            .unwrap()
            .unwrap()
            .status,
        JobStatus::Cancelled
    );

    worker.shutdown().await;
}
