use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::errors::CallErrorKind;

/// One fragment's worth of synthesized speech.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub data: Bytes,
    pub sample_rate: u32,
    /// e.g. "linear16", "mulaw", "mp3"
    pub format: String,
    pub duration_ms: Option<u32>,
}

impl SynthesizedAudio {
    /// Wrap raw bytes, computing the duration for raw sample formats.
    pub fn new(data: impl Into<Bytes>, format: &str, sample_rate: u32) -> Self {
        let data = data.into();
        let bytes_per_sample = match format {
            "linear16" | "pcm" | "pcm16" => Some(2u64),
            "mulaw" | "ulaw" | "alaw" => Some(1u64),
            _ => None,
        };
        let duration_ms = bytes_per_sample
            .filter(|_| sample_rate > 0)
            .map(|width| (data.len() as u64 / width) * 1000 / u64::from(sample_rate))
            .and_then(|ms| u32::try_from(ms).ok());

        Self {
            data,
            sample_rate,
            format: format.to_string(),
            duration_ms,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u32::try_from(duration.as_millis()).ok();
        self
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(|ms| Duration::from_millis(u64::from(ms)))
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("Synthesizer not ready: {0}")]
    NotReady(String),

    #[error("Audio generation failed: {0}")]
    AudioGenerationFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Synthesis timed out after {0:?}")]
    Timeout(Duration),

    #[error("Synthesis cancelled")]
    Cancelled,
}

impl SynthesisError {
    pub fn kind(&self) -> CallErrorKind {
        CallErrorKind::SynthesisFailure
    }
}

pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// A word and how the synthesizer should say it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Pronunciation {
    pub word: String,
    pub pronunciation: String,
}

/// Settings shared by HTTP synthesizers. Serialized into the cache key so a
/// voice or format change never serves stale audio.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SynthesizerConfig {
    pub voice_id: Option<String>,
    pub model: String,
    pub audio_format: String,
    pub sample_rate: u32,
    pub speaking_rate: Option<f32>,
    #[serde(default)]
    pub pronunciations: Vec<Pronunciation>,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            voice_id: None,
            model: String::new(),
            audio_format: "linear16".to_string(),
            sample_rate: 8000,
            speaking_rate: Some(1.0),
            pronunciations: Vec::new(),
        }
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> SynthesisResult<SynthesizedAudio>;

    fn provider_info(&self) -> &'static str {
        "unknown"
    }
}
