//! End-to-end coverage of the Gateway's REST and MCP surfaces, driven with
//! `reqwest` against the router bound on an ephemeral port. Exercises a real
//! `python3` worker process, same as the source system this was modeled on.

use std::sync::Arc;
use std::time::Duration;

use sandbox_core::Config;
use sandbox_core::SessionManager;

async fn spawn_gateway() -> (String, Arc<SessionManager>) {
    let workdir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.workdir_root = workdir.path().to_path_buf();
    config.pool_target = 0;
    config.api_key = None;
    let config = Arc::new(config);

    let manager = SessionManager::new((*config).clone());
    manager.start().await;

    let router = sandbox_gateway::build_router(Arc::clone(&manager), Arc::clone(&config));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    // `workdir` must outlive the spawned server; leak it for test lifetime.
    std::mem::forget(workdir);
    (format!("http://{addr}"), manager)
}

#[tokio::test]
async fn health_reports_uptime_and_active_sessions() {
    let (base, _manager) = spawn_gateway().await;
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn execute_sync_runs_code_and_aggregates_output() {
    let (base, _manager) = spawn_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/ai/sandbox/v1/api/execute_sync"))
        .json(&serde_json::json!({ "code": "print(1 + 1)" }))
        .timeout(Duration::from_secs(20))
        .send()
        .await
        .unwrap();

    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["resultCode"], 0);
    assert_eq!(body["data"]["texts"][0], "2\n");
}

#[tokio::test]
async fn execute_streams_ndjson_lines() {
    let (base, _manager) = spawn_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/ai/sandbox/v1/api/execute"))
        .json(&serde_json::json!({ "code": "print('hi')" }))
        .timeout(Duration::from_secs(20))
        .send()
        .await
        .unwrap();

    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/x-ndjson"
    );
    let body = resp.text().await.unwrap();
    let line: serde_json::Value = serde_json::from_str(body.lines().next().unwrap()).unwrap();
    assert_eq!(line["text"], "hi\n");
}

#[tokio::test]
async fn sessions_lifecycle_create_list_get_delete() {
    let (base, _manager) = spawn_gateway().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/ai/sandbox/v1/api/sessions"))
        .json(&serde_json::json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["session_id"], "s1");

    let listed: serde_json::Value = client
        .get(format!("{base}/ai/sandbox/v1/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["total"], 1);
    assert!(listed["sessions"]["s1"].is_object());

    let detail = client
        .get(format!("{base}/ai/sandbox/v1/api/sessions/s1"))
        .send()
        .await
        .unwrap();
    assert!(detail.status().is_success());

    let deleted = client
        .delete(format!("{base}/ai/sandbox/v1/api/sessions/s1"))
        .send()
        .await
        .unwrap();
    assert!(deleted.status().is_success());

    let missing = client
        .get(format!("{base}/ai/sandbox/v1/api/sessions/s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mcp_initialize_and_tools_list() {
    let (base, _manager) = spawn_gateway().await;
    let client = reqwest::Client::new();

    let init: serde_json::Value = client
        .post(format!("{base}/mcp"))
        .json(&serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(init["result"]["protocolVersion"], "2025-03-26");

    let tools: serde_json::Value = client
        .post(format!("{base}/mcp"))
        .json(&serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = tools["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"execute_python_code"));
}

#[tokio::test]
async fn unauthorized_request_rejected_when_api_key_configured() {
    let workdir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.workdir_root = workdir.path().to_path_buf();
    config.pool_target = 0;
    config.api_key = Some("secret".to_string());
    let config = Arc::new(config);

    let manager = SessionManager::new((*config).clone());
    manager.start().await;
    let router = sandbox_gateway::build_router(Arc::clone(&manager), Arc::clone(&config));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/ai/sandbox/v1/api/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("http://{addr}/ai/sandbox/v1/api/sessions"))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    std::mem::forget(workdir);
}
