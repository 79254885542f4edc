use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// What a recognizer reports while the caller talks.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// Interim hypothesis; may change.
    Partial { text: String },
    /// Stable text for a finished utterance.
    Final { text: String, confidence: f32 },
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        Self::Partial { text: text.into() }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self::Final {
            text: text.into(),
            confidence: 1.0,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Partial { text } | Self::Final { text, .. } => text,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum STTError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Recognizer not started")]
    NotStarted,

    #[error("Audio processing error: {0}")]
    AudioProcessingError(String),

    #[error("Provider error: {0}")]
    ProviderError(String),
}

pub type STTResult<T> = Result<T, STTError>;

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Open the recognition stream. Events are delivered on `events` until
    /// [`SpeechRecognizer::stop`] is called or the sender is dropped.
    async fn start(&mut self, events: mpsc::Sender<TranscriptEvent>) -> STTResult<()>;

    async fn send_audio(&mut self, audio: Bytes) -> STTResult<()>;

    async fn stop(&mut self) -> STTResult<()>;

    fn provider_info(&self) -> &'static str {
        "unknown"
    }
}
