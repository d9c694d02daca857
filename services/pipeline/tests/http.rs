mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::{config, FEATURES};
use modelops::{Predictor, RandomSearch};
use pipeline::hub::{HfHubClient, HubUploader, RepoRef, RepoType, UploadError, UploadTarget};
use pipeline::serve::{router, AppState};
use serde_json::{json, Value};

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn trained_predictor(root: &std::path::Path) -> Predictor {
    let cfg = config(root, &[]);
    dataprep::prepare(&cfg.raw_data_file, &cfg.data_dir, &cfg.prep).unwrap();
    let data = modelops::load_processed(&cfg.data_dir).unwrap();
    let outcome = modelops::train(&data, &cfg.train, &mut RandomSearch::new(3)).unwrap();
    Predictor::from_artifact(outcome.artifact).unwrap()
}

fn features(rpm: f64) -> Value {
    json!({ FEATURES[0]: rpm, FEATURES[1]: 3.4, FEATURES[2]: 96.0 })
}

#[tokio::test]
async fn serves_health_model_and_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let predictor = trained_predictor(dir.path());
    let version = predictor.schema_version().to_string();
    let addr = spawn(router(Arc::new(AppState { predictor }))).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let health: Value =
        client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["schema_version"], version.as_str());

    let model: Value =
        client.get(format!("{base}/model")).send().await.unwrap().json().await.unwrap();
    assert_eq!(model["model_type"], "gradient_boosted_trees");
    assert_eq!(model["class_mapping"]["1"], "Faulty");

    let resp = client
        .post(format!("{base}/predict"))
        .json(&json!({ "features": features(1750.0), "schema_version": version }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["predicted_class"], "Faulty");
    assert_eq!(body["predicted_label"], "1");
    assert!(body["probabilities"]["Normal"].is_number());

    let mut missing = features(900.0);
    missing.as_object_mut().unwrap().remove(FEATURES[1]);
    let resp = client
        .post(format!("{base}/predict"))
        .json(&json!({ "features": missing }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("schema mismatch"));

    let resp = client
        .post(format!("{base}/predict"))
        .json(&json!({ "features": features(900.0), "schema_version": "stale" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
}

#[derive(Clone, Default)]
struct FakeHub {
    requests: Arc<Mutex<Vec<(String, Option<String>, String)>>>,
    reject_token: bool,
}

async fn create_repo(State(hub): State<FakeHub>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).map(str::to_string);
    hub.requests
        .lock()
        .unwrap()
        .push(("create".into(), auth, String::from_utf8_lossy(&body).into_owned()));
    if hub.reject_token {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::CONFLICT
    }
}

async fn commit(
    State(hub): State<FakeHub>,
    Path((kind, org, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).map(str::to_string);
    hub.requests.lock().unwrap().push((
        format!("commit {kind} {org}/{name}"),
        auth,
        String::from_utf8_lossy(&body).into_owned(),
    ));
    Json(json!({ "commitUrl": format!("http://hub/{org}/{name}/commit/abc"), "commitOid": "abc" }))
}

fn fake_hub_app(hub: FakeHub) -> Router {
    Router::new()
        .route("/api/repos/create", post(create_repo))
        .route("/api/:kind/:org/:name/commit/main", post(commit))
        .with_state(hub)
}

#[tokio::test]
async fn hub_client_commits_files_as_ndjson() {
    let hub = FakeHub::default();
    let addr = spawn(fake_hub_app(hub.clone())).await;
    let client = HfHubClient::new(format!("http://{addr}"), "hf_secret");

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("X_train.csv"), "a,b\n1,2\n").unwrap();
    std::fs::write(dir.path().join("y_train.csv"), "label\n1\n").unwrap();

    let repo = RepoRef::new("me/engine-data", RepoType::Dataset);
    client.ensure_repo(&repo).await.unwrap();
    let target = UploadTarget {
        repo,
        path_in_repo: "processed".into(),
        commit_message: "Upload processed data".into(),
    };
    let receipt = client.upload(dir.path(), &target).await.unwrap();
    assert_eq!(receipt.files, vec!["processed/X_train.csv", "processed/y_train.csv"]);
    assert_eq!(receipt.commit_url.as_deref(), Some("http://hub/me/engine-data/commit/abc"));

    let requests = hub.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    let (_, auth, create_body) = &requests[0];
    assert_eq!(auth.as_deref(), Some("Bearer hf_secret"));
    let create: Value = serde_json::from_str(create_body).unwrap();
    assert_eq!(create["name"], "engine-data");
    assert_eq!(create["organization"], "me");
    assert_eq!(create["type"], "dataset");

    let (route, _, body) = &requests[1];
    assert_eq!(route, "commit datasets me/engine-data");
    let lines: Vec<Value> = body.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(lines[0]["value"]["summary"], "Upload processed data");
    assert_eq!(lines[1]["value"]["path"], "processed/X_train.csv");
    let decoded = BASE64.decode(lines[1]["value"]["content"].as_str().unwrap()).unwrap();
    assert_eq!(decoded, b"a,b\n1,2\n");
}

#[tokio::test]
async fn hub_client_reports_rejected_token() {
    let hub = FakeHub { reject_token: true, ..Default::default() };
    let addr = spawn(fake_hub_app(hub)).await;
    let client = HfHubClient::new(format!("http://{addr}"), "bad");
    let err = client
        .ensure_repo(&RepoRef::new("me/engine-model", RepoType::Model))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Unauthorized(401)));
}
