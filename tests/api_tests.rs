use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::util::ServiceExt;

use callwright::{ServerConfig, routes, state::AppState};

async fn test_state(api_secret: Option<&str>) -> Arc<AppState> {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 3001,
        state_api_secret: api_secret.map(str::to_string),
        auth_required: api_secret.is_some(),
        ..ServerConfig::default()
    };
    AppState::new(config).await.unwrap()
}

fn app(state: &Arc<AppState>) -> Router {
    routes::create_app(state.clone())
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let state = test_state(None).await;

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app(&state).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "OK");
    assert_eq!(json["calls"], 0);
    assert_eq!(json["graphs"], 0);
}

#[tokio::test]
async fn test_health_check_counts_loaded_graphs() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("reminder.yaml"),
        "id: reminder\nstart: hello\nnodes:\n  - {id: hello, kind: terminal, message: \"Bye\"}\n",
    )
    .unwrap();
    let config = ServerConfig {
        graphs_path: Some(dir.path().to_path_buf()),
        ..ServerConfig::default()
    };
    let state = AppState::new(config).await.unwrap();

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let json = body_json(app(&state).oneshot(request).await.unwrap()).await;
    assert_eq!(json["graphs"], 1);
    assert!(state.core_state.graphs.get("reminder").is_some());
}

#[tokio::test]
async fn test_list_calls_empty() {
    let state = test_state(None).await;

    let request = Request::builder().uri("/calls").body(Body::empty()).unwrap();
    let response = app(&state).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
}

#[tokio::test]
async fn test_playback_end_for_foreign_call_releases_slot() {
    let state = test_state(None).await;
    let handle = state.core_state.coordinator().for_call("remote-call");
    let lease = handle.acquire_playback("unit-1").await.unwrap();
    // The call lives on another worker; only the callback releases the slot.
    std::mem::forget(lease);
    assert_eq!(handle.snapshot().await.unwrap().playback_count, 1);

    let event = json!({"event": "ended", "unit_id": "unit-1"});
    let response = app(&state)
        .oneshot(post_json("/calls/remote-call/playback", event.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["hosted"], false);
    assert_eq!(json["released"], true);
    assert_eq!(json["playback_count"], 0);

    // A duplicate callback changes nothing.
    let response = app(&state)
        .oneshot(post_json("/calls/remote-call/playback", event))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["released"], false);
    assert_eq!(json["playback_count"], 0);
}

#[tokio::test]
async fn test_playback_start_marks_agent_speaking() {
    let state = test_state(None).await;
    let shared = state.core_state.coordinator().for_call("c7");
    let lease = shared.acquire_playback("u1").await.unwrap();

    let response = app(&state)
        .oneshot(post_json(
            "/calls/c7/playback",
            json!({"event": "started", "unit_id": "u1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["released"], false);
    assert_eq!(json["playback_count"], Value::Null);
    assert!(shared.snapshot().await.unwrap().agent_speaking);

    lease.release().await.unwrap();
    assert!(!shared.snapshot().await.unwrap().agent_speaking);
}

#[tokio::test]
async fn test_playback_start_after_end_is_ignored() {
    let state = test_state(None).await;
    let shared = state.core_state.coordinator().for_call("c8");
    let lease = shared.acquire_playback("u1").await.unwrap();

    for event in ["ended", "started"] {
        let response = app(&state)
            .oneshot(post_json(
                "/calls/c8/playback",
                json!({"event": event, "unit_id": "u1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    lease.release().await.unwrap();

    let snapshot = shared.snapshot().await.unwrap();
    assert!(!snapshot.agent_speaking);
    assert_eq!(snapshot.playback_count, 0);
}

#[tokio::test]
async fn test_playback_event_rejects_empty_unit_id() {
    let state = test_state(None).await;

    let response = app(&state)
        .oneshot(post_json(
            "/calls/c1/playback",
            json!({"event": "ended", "unit_id": "  "}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_call_state_for_unknown_call() {
    let state = test_state(None).await;

    let request = Request::builder()
        .uri("/calls/nobody/state")
        .body(Body::empty())
        .unwrap();
    let response = app(&state).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["session"], Value::Null);
    assert_eq!(json["shared"]["call_id"], "nobody");
    assert_eq!(json["shared"]["playback_count"], 0);
    assert_eq!(json["shared"]["agent_speaking"], false);
}

#[tokio::test]
async fn test_state_endpoint_runs_ops() {
    let state = test_state(None).await;

    let response = app(&state)
        .oneshot(post_json(
            "/state",
            json!({"op": "set", "key": "greeting", "value": "hi", "ttl_ms": 60000}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"type": "done"}));

    let response = app(&state)
        .oneshot(post_json("/state", json!({"op": "get", "key": "greeting"})))
        .await
        .unwrap();
    assert_eq!(
        body_json(response).await,
        json!({"type": "value", "value": "hi"})
    );

    let slot = json!({
        "op": "acquire_slot",
        "set_key": "set",
        "counter_key": "count",
        "member": "u1",
        "ttl_ms": 60000
    });
    let response = app(&state)
        .oneshot(post_json("/state", slot.clone()))
        .await
        .unwrap();
    assert_eq!(
        body_json(response).await,
        json!({"type": "slot", "changed": true, "count": 1})
    );
    let response = app(&state).oneshot(post_json("/state", slot)).await.unwrap();
    assert_eq!(
        body_json(response).await,
        json!({"type": "slot", "changed": false, "count": 1})
    );
}

#[tokio::test]
async fn test_state_endpoint_wrong_type_is_conflict() {
    let state = test_state(None).await;

    app(&state)
        .oneshot(post_json(
            "/state",
            json!({"op": "set", "key": "k", "value": "text", "ttl_ms": 60000}),
        ))
        .await
        .unwrap();
    let response = app(&state)
        .oneshot(post_json(
            "/state",
            json!({"op": "increment", "key": "k", "ttl_ms": 60000}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_state_endpoint_requires_secret_when_configured() {
    let state = test_state(Some("s3cret")).await;
    let op = json!({"op": "get", "key": "anything"});

    let response = app(&state)
        .oneshot(post_json("/state", op.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut request = post_json("/state", op.clone());
    request.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer wrong".parse().unwrap(),
    );
    let response = app(&state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut request = post_json("/state", op);
    request.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer s3cret".parse().unwrap(),
    );
    let response = app(&state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Call routes stay public.
    let request = Request::builder().uri("/calls").body(Body::empty()).unwrap();
    let response = app(&state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_state_endpoint_absent_with_remote_coordinator() {
    let config = ServerConfig {
        state_store_url: Some("http://127.0.0.1:9".to_string()),
        ..ServerConfig::default()
    };
    let state = AppState::new(config).await.unwrap();

    let response = app(&state)
        .oneshot(post_json("/state", json!({"op": "get", "key": "k"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
