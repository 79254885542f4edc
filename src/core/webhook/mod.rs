//! Side-effecting HTTP calls made by webhook nodes.

mod base;
mod http;

pub use base::{
    WebhookError, WebhookExecutor, WebhookRequest, WebhookResponse, WebhookResult, WebhookSpec,
};
pub use http::HttpWebhookExecutor;
