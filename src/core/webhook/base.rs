use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::errors::CallErrorKind;
use crate::core::response::template::{render, render_json};

#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    #[error("Webhook timed out after {0:?}")]
    Timeout(Duration),

    #[error("Webhook answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Webhook network error: {0}")]
    Network(String),

    #[error("Invalid webhook request: {0}")]
    InvalidRequest(String),
}

impl WebhookError {
    pub fn kind(&self) -> CallErrorKind {
        CallErrorKind::WebhookFailure
    }
}

pub type WebhookResult<T> = Result<T, WebhookError>;

fn default_method() -> String {
    "POST".to_string()
}

/// A webhook as declared on a graph node. Every string field may contain
/// `{variable}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body template.
    #[serde(default)]
    pub body: Option<String>,
}

impl WebhookSpec {
    /// Substitute the call's variables. Body values are JSON-escaped.
    pub fn render(&self, variables: &HashMap<String, String>) -> WebhookRequest {
        WebhookRequest {
            url: render(&self.url, variables),
            method: self.method.to_ascii_uppercase(),
            headers: self
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), render(value, variables)))
                .collect(),
            body: self.body.as_deref().map(|body| render_json(body, variables)),
        }
    }
}

/// A fully rendered request, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    /// Parsed JSON, or the raw text as a JSON string when the body is not JSON.
    pub body: serde_json::Value,
}

impl WebhookResponse {
    /// Flatten the response into string variables: `{prefix}` holds the whole
    /// body, and each top-level field of an object body becomes
    /// `{prefix}.{field}`.
    pub fn bindings(&self, prefix: &str) -> HashMap<String, String> {
        let mut out = HashMap::new();
        out.insert(prefix.to_string(), value_text(&self.body));
        if let serde_json::Value::Object(fields) = &self.body {
            for (field, value) in fields {
                out.insert(format!("{prefix}.{field}"), value_text(value));
            }
        }
        out
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
pub trait WebhookExecutor: Send + Sync {
    async fn execute(&self, request: WebhookRequest) -> WebhookResult<WebhookResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_renders_all_fields() {
        let spec = WebhookSpec {
            url: "https://crm.example.com/contacts/{contact_id}".to_string(),
            method: "put".to_string(),
            headers: BTreeMap::from([("X-Call".to_string(), "{call_id}".to_string())]),
            body: Some(r#"{"date": "{date}"}"#.to_string()),
        };
        let variables = HashMap::from([
            ("contact_id".to_string(), "42".to_string()),
            ("call_id".to_string(), "c1".to_string()),
            ("date".to_string(), "May \"5\"".to_string()),
        ]);

        let request = spec.render(&variables);
        assert_eq!(request.url, "https://crm.example.com/contacts/42");
        assert_eq!(request.method, "PUT");
        assert_eq!(request.headers, vec![("X-Call".to_string(), "c1".to_string())]);
        let body: serde_json::Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({"date": "May \"5\""}));
    }

    #[test]
    fn test_spec_defaults_to_post() {
        let spec: WebhookSpec = serde_yaml::from_str("url: http://x/hook").unwrap();
        assert_eq!(spec.method, "POST");
        assert!(spec.headers.is_empty());
        assert!(spec.body.is_none());
    }

    #[test]
    fn test_response_bindings() {
        let response = WebhookResponse {
            status: 200,
            body: json!({"slot": "9am", "count": 3, "note": null}),
        };
        let bindings = response.bindings("booking");
        assert_eq!(bindings["booking.slot"], "9am");
        assert_eq!(bindings["booking.count"], "3");
        assert_eq!(bindings["booking.note"], "");
        assert!(bindings["booking"].contains("\"slot\""));

        let text = WebhookResponse {
            status: 200,
            body: json!("accepted"),
        };
        assert_eq!(text.bindings("r")["r"], "accepted");
    }
}
