//! Deepgram's REST speak endpoint as an [`HttpSynthesizer`](super::HttpSynthesizer)
//! request builder.

use serde_json::json;

use super::base::SynthesizerConfig;
use super::http::SynthesisRequestBuilder;

pub const DEEPGRAM_SPEAK_URL: &str = "https://api.deepgram.com/v1/speak";

pub struct DeepgramRequestBuilder {
    endpoint: String,
    api_key: String,
    config: SynthesizerConfig,
}

impl DeepgramRequestBuilder {
    pub fn new(api_key: impl Into<String>, config: SynthesizerConfig) -> Self {
        Self {
            endpoint: DEEPGRAM_SPEAK_URL.to_string(),
            api_key: api_key.into(),
            config,
        }
    }

    /// Point at another endpoint, e.g. a regional deployment or a test server.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("encoding", self.config.audio_format.clone()),
            ("sample_rate", self.config.sample_rate.to_string()),
        ];
        let model = self
            .config
            .voice_id
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.config.model);
        if !model.is_empty() {
            query.push(("model", model.to_string()));
        }
        // Raw telephony formats must not be wrapped in a container.
        if matches!(self.config.audio_format.as_str(), "linear16" | "mulaw" | "alaw") {
            query.push(("container", "none".to_string()));
        }
        query
    }
}

impl SynthesisRequestBuilder for DeepgramRequestBuilder {
    fn build_request(&self, client: &reqwest::Client, text: &str) -> reqwest::RequestBuilder {
        client
            .post(&self.endpoint)
            .query(&self.query())
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&json!({ "text": text }))
    }

    fn config(&self) -> &SynthesizerConfig {
        &self.config
    }

    fn provider_name(&self) -> &'static str {
        "deepgram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_prefers_voice_over_model() {
        let builder = DeepgramRequestBuilder::new(
            "key",
            SynthesizerConfig {
                voice_id: Some("aura-asteria-en".to_string()),
                model: "aura".to_string(),
                audio_format: "mulaw".to_string(),
                sample_rate: 8000,
                ..SynthesizerConfig::default()
            },
        );
        let query = builder.query();
        assert!(query.contains(&("model", "aura-asteria-en".to_string())));
        assert!(query.contains(&("encoding", "mulaw".to_string())));
        assert!(query.contains(&("sample_rate", "8000".to_string())));
        assert!(query.contains(&("container", "none".to_string())));
    }

    #[test]
    fn test_request_shape() {
        let builder = DeepgramRequestBuilder::new("secret", SynthesizerConfig::default())
            .with_endpoint("http://localhost:9/v1/speak");
        let request = builder
            .build_request(&reqwest::Client::new(), "Hello there")
            .build()
            .unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/v1/speak");
        assert_eq!(request.headers()["authorization"], "Token secret");
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed["text"], "Hello there");
    }
}
