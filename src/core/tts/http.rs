//! Request/response speech synthesis over HTTP.
//!
//! Vendors differ only in how the request is built; everything else (the
//! pooled client, pronunciation replacement, status handling, the audio
//! cache) lives in [`HttpSynthesizer`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use regex::Regex;
use tracing::{debug, error, warn};
use xxhash_rust::xxh3::xxh3_128;

use super::base::{
    Pronunciation, SpeechSynthesizer, SynthesisError, SynthesisResult, SynthesizedAudio,
    SynthesizerConfig,
};
use crate::core::cache::CacheStore;
use crate::utils::req_manager::ReqManager;

const AUDIO_NAMESPACE: &str = "audio";

/// Word-boundary pronunciation substitutions, compiled once.
#[derive(Clone, Default)]
pub struct PronunciationReplacer {
    patterns: Vec<(Regex, String)>,
}

impl PronunciationReplacer {
    pub fn new(pronunciations: &[Pronunciation]) -> Self {
        let patterns = pronunciations
            .iter()
            .filter_map(|p| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(&p.word));
                match Regex::new(&pattern) {
                    Ok(regex) => Some((regex, p.pronunciation.clone())),
                    Err(e) => {
                        error!(word = %p.word, error = %e, "Skipping pronunciation");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn apply(&self, text: &str) -> String {
        self.patterns
            .iter()
            .fold(text.to_string(), |acc, (pattern, replacement)| {
                pattern.replace_all(&acc, replacement.as_str()).into_owned()
            })
    }
}

/// The vendor-specific part of an HTTP synthesizer.
pub trait SynthesisRequestBuilder: Send + Sync {
    fn build_request(&self, client: &reqwest::Client, text: &str) -> reqwest::RequestBuilder;

    fn config(&self) -> &SynthesizerConfig;

    fn provider_name(&self) -> &'static str {
        "http"
    }
}

pub struct HttpSynthesizer<B: SynthesisRequestBuilder> {
    builder: B,
    requests: Arc<ReqManager>,
    replacer: PronunciationReplacer,
    cache: Option<Arc<CacheStore>>,
    cache_ttl: Option<Duration>,
    config_hash: String,
}

impl<B: SynthesisRequestBuilder> HttpSynthesizer<B> {
    pub fn new(builder: B, requests: Arc<ReqManager>) -> Self {
        let config = builder.config();
        let replacer = PronunciationReplacer::new(&config.pronunciations);
        let config_hash = serde_json::to_vec(config)
            .map(|encoded| format!("{:032x}", xxh3_128(&encoded)))
            .unwrap_or_default();
        Self {
            builder,
            requests,
            replacer,
            cache: None,
            cache_ttl: None,
            config_hash,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>, ttl: Option<Duration>) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = ttl;
        self
    }

    fn cache_key(&self, spoken: &str) -> String {
        format!("{}:{:032x}", self.config_hash, xxh3_128(spoken.as_bytes()))
    }

    fn wrap(&self, data: bytes::Bytes) -> SynthesizedAudio {
        let config = self.builder.config();
        SynthesizedAudio::new(data, &config.audio_format, config.sample_rate)
    }
}

#[async_trait]
impl<B: SynthesisRequestBuilder> SpeechSynthesizer for HttpSynthesizer<B> {
    async fn synthesize(&self, text: &str) -> SynthesisResult<SynthesizedAudio> {
        let spoken = self.replacer.apply(text);
        let key = self.cache_key(&spoken);

        if let Some(cache) = &self.cache {
            match cache.get(AUDIO_NAMESPACE, &key).await {
                Ok(Some(bytes)) => {
                    debug!(text = %spoken, size = bytes.len(), "Synthesis cache hit");
                    return Ok(self.wrap(bytes));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Synthesis cache read failed"),
            }
        }

        let guard = self
            .requests
            .acquire()
            .await
            .map_err(|e| SynthesisError::NotReady(e.to_string()))?;

        let result = self
            .builder
            .build_request(guard.client(), &spoken)
            .send()
            .await;
        guard.record(&result);
        let response = result.map_err(|e| SynthesisError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::ProviderError(format!("{status}: {body}")));
        }

        let mut audio = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SynthesisError::NetworkError(e.to_string()))?;
            audio.extend_from_slice(&chunk);
        }
        if audio.is_empty() {
            return Err(SynthesisError::AudioGenerationFailed(
                "provider returned no audio".to_string(),
            ));
        }
        let audio = audio.freeze();

        if let Some(cache) = &self.cache
            && let Err(e) = cache
                .put(AUDIO_NAMESPACE, &key, audio.clone(), self.cache_ttl)
                .await
        {
            warn!(error = %e, "Synthesis cache write failed");
        }

        debug!(
            provider = self.builder.provider_name(),
            size = audio.len(),
            "Synthesized fragment"
        );
        Ok(self.wrap(audio))
    }

    fn provider_info(&self) -> &'static str {
        self.builder.provider_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pronunciations_respect_word_boundaries() {
        let replacer = PronunciationReplacer::new(&[
            Pronunciation {
                word: "API".to_string(),
                pronunciation: "A P I".to_string(),
            },
        ]);
        assert_eq!(replacer.apply("The api is up"), "The A P I is up");
        assert_eq!(replacer.apply("RAPID response"), "RAPID response");
    }

    #[test]
    fn test_empty_replacer_is_identity() {
        let replacer = PronunciationReplacer::default();
        assert_eq!(replacer.apply("unchanged"), "unchanged");
    }
}
