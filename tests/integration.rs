use std::{collections::HashMap, fs, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    extract::{Form, Multipart, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use testflow::{
    CaseStatus, DefaultRunner, EngineConfig, ExecutionMode, ReportFormat,
    ReportWriter, RunRequest, RunSummary, Suite, SuiteLoader, TestRunner,
};
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

async fn login(Json(body): Json<Value>) -> impl IntoResponse {
    let user = body["user"].as_str().unwrap_or("anonymous").to_string();
    (
        [("Set-Cookie", "session=s-1; Path=/")],
        Json(json!({ "token": format!("tok-{user}") })),
    )
}

async fn items(
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer tok-"));
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }
    let page = query
        .get("page")
        .and_then(|p| p.parse::<u64>().ok())
        .unwrap_or(1);
    Json(json!({
        "page": page,
        "items": [
            {"id": 1, "name": "apple"},
            {"id": 2, "name": "pear"}
        ]
    }))
    .into_response()
}

async fn upload(mut multipart: Multipart) -> Json<Value> {
    let mut fields = Map::new();
    let mut files = Map::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let bytes = field.bytes().await.unwrap_or_default();
                files.insert(
                    name,
                    json!({ "file_name": file_name, "size": bytes.len() }),
                );
            }
            None => {
                let text = field.text().await.unwrap_or_default();
                fields.insert(name, Value::String(text));
            }
        }
    }
    Json(json!({ "fields": fields, "files": files }))
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route("/login", post(login))
            .route("/items", get(items))
            .route("/text", get(|| async move { "order id=42 created" }))
            .route(
                "/ping",
                get(|| async move { ([("X-Pong", "yes")], "pong") }),
            )
            .route(
                "/form",
                post(|Form(fields): Form<HashMap<String, String>>| async move {
                    Json(fields)
                }),
            )
            .route("/upload", post(upload))
            .route(
                "/slow",
                get(|| async move {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "late"
                }),
            );

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn fixture(name: &str, replacements: &[(&str, &str)]) -> String {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let path = manifest_dir.join("tests/fixtures").join(name);
    let mut content = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {path:?}: {e}"));
    for (placeholder, value) in replacements {
        content = content.replace(placeholder, value);
    }
    content
}

fn load_suite(base_url: &str, upload_path: &str) -> Suite {
    let replacements =
        [("__BASE_URL__", base_url), ("__UPLOAD__", upload_path)];
    let mut suite = Suite::default();
    for name in ["shop.yaml", "bodies.yaml", "failures.yaml"] {
        let content = fixture(name, &replacements);
        let part = Suite::from_yaml(&content)
            .unwrap_or_else(|e| panic!("failed to parse {name}: {e}"));
        suite.merge(part);
    }
    suite
}

fn request(
    case_ids: Vec<u64>,
    mode: ExecutionMode,
    environment: Option<&str>,
) -> RunRequest {
    RunRequest {
        run_id: "it".to_string(),
        environment: environment.map(str::to_string),
        case_ids,
        mode: Some(mode),
    }
}

async fn run(
    server: &TestServer,
    case_ids: Vec<u64>,
    mode: ExecutionMode,
    environment: Option<&str>,
) -> RunSummary {
    let suite = load_suite(&server.base_url, "/nonexistent");
    let runner = DefaultRunner::new(suite, EngineConfig::default());
    runner.run(&request(case_ids, mode, environment)).await
}

#[tokio::test]
async fn quoted_login_feeds_token_to_later_steps() {
    let server = TestServer::spawn().await;
    let summary = run(&server, vec![2], ExecutionMode::Sequential, None).await;

    assert!(summary.success, "run should succeed: {summary:#?}");
    let case = &summary.details[0];
    let names: Vec<&str> = case.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["login", "list"]);
    assert_eq!(case.steps[0].case_id, 1);
    assert_eq!(case.steps[1].case_id, 2);

    let list = &case.steps[1];
    let request = list.request.as_ref().unwrap();
    assert_eq!(
        request.headers.get("Authorization").unwrap(),
        "Bearer tok-alice"
    );
    assert_eq!(request.headers.get("X-Client").unwrap(), "testflow");
    assert_eq!(request.params.get("page").unwrap(), "2");
    assert_eq!(list.extractions[0].value, Some(json!("apple")));

    server.shutdown().await;
}

#[tokio::test]
async fn environment_variables_override_project_variables() {
    let server = TestServer::spawn().await;
    let summary =
        run(&server, vec![1], ExecutionMode::Sequential, Some("staging")).await;

    assert!(summary.success, "run should succeed: {summary:#?}");
    let login = &summary.details[0].steps[0];
    assert_eq!(login.extractions[0].value, Some(json!("tok-bob")));

    server.shutdown().await;
}

#[tokio::test]
async fn regexp_cookie_skip_and_repeat() {
    let server = TestServer::spawn().await;
    let summary =
        run(&server, vec![3, 4], ExecutionMode::Sequential, None).await;

    assert!(summary.success, "run should succeed: {summary:#?}");

    let text = &summary.details[0];
    assert_eq!(text.steps[0].extractions[0].value, Some(json!("42")));

    let session = &summary.details[1];
    let names: Vec<&str> =
        session.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["login again", "ping [1/2]", "ping [2/2]"]);
    assert_eq!(session.counts.skipped, 1);
    assert_eq!(session.counts.total, 3);
    assert_eq!(summary.step_counts.skipped, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn form_and_multipart_bodies_are_sent() {
    let server = TestServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let upload = dir.path().join("notes.txt");
    fs::write(&upload, "hello world").unwrap();

    let suite = load_suite(&server.base_url, &upload.display().to_string());
    let runner = DefaultRunner::new(suite, EngineConfig::default());
    let summary = runner
        .run(&request(vec![5], ExecutionMode::Sequential, None))
        .await;

    assert!(summary.success, "run should succeed: {summary:#?}");
    assert_eq!(summary.details[0].steps.len(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn missing_upload_file_is_a_transport_failure() {
    let server = TestServer::spawn().await;
    let summary = run(&server, vec![5], ExecutionMode::Sequential, None).await;

    let case = &summary.details[0];
    assert_eq!(case.status, CaseStatus::Failed);
    assert!(case.steps[0].success);
    assert!(case.steps[1].error.as_deref().unwrap().contains("/nonexistent"));

    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_run_reports_every_case_in_order() {
    let server = TestServer::spawn().await;
    let summary =
        run(&server, vec![1, 6, 2], ExecutionMode::Concurrent, None).await;

    assert!(!summary.success);
    assert_eq!(summary.counts.total, 3);
    assert_eq!(summary.counts.pass, 2);
    assert_eq!(summary.counts.fail, 1);
    let ids: Vec<u64> = summary.details.iter().map(|d| d.case_id).collect();
    assert_eq!(ids, vec![1, 6, 2]);

    let unauthorized = &summary.details[1];
    let assertions = &unauthorized.steps[0].assertions;
    assert_eq!(assertions.len(), 2);
    assert!(!assertions[0].passed);
    assert!(assertions[1].passed);

    server.shutdown().await;
}

#[tokio::test]
async fn timeout_stops_the_case() {
    let server = TestServer::spawn().await;
    let summary = run(&server, vec![7], ExecutionMode::Sequential, None).await;

    let case = &summary.details[0];
    assert_eq!(case.status, CaseStatus::Failed);
    assert_eq!(case.steps.len(), 1);
    assert!(case.error.as_deref().unwrap().contains("timed out"));
    // The slow handler is still sleeping; dropping aborts the server.
    drop(server);
}

#[tokio::test]
async fn cyclic_cases_are_excluded_without_stopping_the_run() {
    let server = TestServer::spawn().await;
    let summary =
        run(&server, vec![8, 1], ExecutionMode::Sequential, None).await;

    assert_eq!(summary.details[0].status, CaseStatus::Excluded);
    assert!(summary.details[0]
        .error
        .as_deref()
        .unwrap()
        .contains("8 -> 9 -> 8"));
    assert_eq!(summary.details[1].status, CaseStatus::Passed);
    assert_eq!(summary.counts.fail, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn report_writer_receives_the_summary() {
    let server = TestServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();

    let mut runner = DefaultRunner::new(
        load_suite(&server.base_url, "/nonexistent"),
        EngineConfig::default(),
    );
    let writer = ReportWriter::new(dir.path(), ReportFormat::Json);
    runner.add_observer(Arc::new(writer));
    let summary = runner
        .run(&request(vec![1], ExecutionMode::Sequential, None))
        .await;

    let reports: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(reports.len(), 1);
    let path = reports[0].as_ref().unwrap().path();
    let content = fs::read_to_string(path).unwrap();
    let written: RunSummary = serde_json::from_str(&content).unwrap();
    assert_eq!(written.run_id, summary.run_id);
    assert_eq!(written.counts, summary.counts);

    server.shutdown().await;
}

#[tokio::test]
async fn suite_loader_reads_a_fixture_directory() {
    let dir = tempfile::tempdir().unwrap();
    let replacements = [
        ("__BASE_URL__", "http://127.0.0.1:1"),
        ("__UPLOAD__", "/tmp/x"),
    ];
    for name in ["shop.yaml", "bodies.yaml", "failures.yaml"] {
        fs::write(dir.path().join(name), fixture(name, &replacements)).unwrap();
    }

    let mut loader = SuiteLoader::new();
    loader.add_path(dir.path());
    let suite = loader.load_all().unwrap();
    assert_eq!(suite.cases.len(), 9);
    assert_eq!(suite.scripts[0].name, "helpers");
    assert_eq!(suite.project(1).unwrap().host, "http://127.0.0.1:1");
}
