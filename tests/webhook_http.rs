use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use callwright::core::webhook::{HttpWebhookExecutor, WebhookError, WebhookExecutor, WebhookSpec};
use callwright::utils::req_manager::ReqManager;

fn executor() -> HttpWebhookExecutor {
    HttpWebhookExecutor::new(Arc::new(ReqManager::new(2).unwrap()))
}

fn variables(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_rendered_webhook_reaches_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bookings/42"))
        .and(header("x-call-id", "call-9"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"date": "Friday", "note": "said \"asap\""})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"slot": "9am", "id": 7})))
        .expect(1)
        .mount(&server)
        .await;

    let spec = WebhookSpec {
        url: format!("{}/bookings/{{contact}}", server.uri()),
        method: "post".to_string(),
        headers: BTreeMap::from([("X-Call-Id".to_string(), "{call_id}".to_string())]),
        body: Some(r#"{"date": "{date}", "note": "{note}"}"#.to_string()),
    };
    let request = spec.render(&variables(&[
        ("contact", "42"),
        ("call_id", "call-9"),
        ("date", "Friday"),
        ("note", "said \"asap\""),
    ]));

    let response = executor().execute(request).await.unwrap();
    assert_eq!(response.status, 201);
    let bindings = response.bindings("booking");
    assert_eq!(bindings["booking.slot"], "9am");
    assert_eq!(bindings["booking.id"], "7");
}

#[tokio::test]
async fn test_plain_text_body_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
        .mount(&server)
        .await;

    let spec = WebhookSpec {
        url: format!("{}/status", server.uri()),
        method: "GET".to_string(),
        headers: BTreeMap::new(),
        body: None,
    };
    let response = executor()
        .execute(spec.render(&HashMap::new()))
        .await
        .unwrap();
    assert_eq!(response.body, json!("accepted"));
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let spec = WebhookSpec {
        url: format!("{}/hook", server.uri()),
        method: "POST".to_string(),
        headers: BTreeMap::new(),
        body: None,
    };
    let err = executor()
        .execute(spec.render(&HashMap::new()))
        .await
        .unwrap_err();
    match err {
        WebhookError::Status { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_url_is_rejected_before_sending() {
    let spec = WebhookSpec {
        url: "not a url {missing}".to_string(),
        method: "POST".to_string(),
        headers: BTreeMap::new(),
        body: None,
    };
    let err = executor()
        .execute(spec.render(&HashMap::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidRequest(_)), "{err:?}");
}
