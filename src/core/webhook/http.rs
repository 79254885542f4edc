use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info};

use super::base::{WebhookError, WebhookExecutor, WebhookRequest, WebhookResponse, WebhookResult};
use crate::utils::req_manager::ReqManager;

/// Sends webhook requests through the shared connection pool.
pub struct HttpWebhookExecutor {
    requests: Arc<ReqManager>,
}

impl HttpWebhookExecutor {
    pub fn new(requests: Arc<ReqManager>) -> Self {
        Self { requests }
    }
}

#[async_trait]
impl WebhookExecutor for HttpWebhookExecutor {
    async fn execute(&self, request: WebhookRequest) -> WebhookResult<WebhookResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| WebhookError::InvalidRequest(format!("method {}", request.method)))?;
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| WebhookError::InvalidRequest(format!("url {}: {e}", request.url)))?;

        let guard = self
            .requests
            .acquire()
            .await
            .map_err(|e| WebhookError::Network(e.to_string()))?;

        let mut builder = guard.client().request(method.clone(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            let is_json = serde_json::from_str::<serde_json::Value>(&body).is_ok();
            let has_content_type = request
                .headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
            if is_json && !has_content_type {
                builder = builder.header(CONTENT_TYPE, "application/json");
            }
            builder = builder.body(body);
        }

        debug!(method = %method, url = %request.url, "Executing webhook");
        let result = builder.send().await;
        guard.record(&result);
        let response = result.map_err(|e| {
            if e.is_timeout() {
                WebhookError::Network(format!("request timed out: {e}"))
            } else {
                WebhookError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| WebhookError::Network(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(WebhookError::Status { status, body: text });
        }

        info!(url = %request.url, status, "Webhook succeeded");
        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };
        Ok(WebhookResponse { status, body })
    }
}
