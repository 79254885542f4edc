//! Language-model capabilities the engine consumes: streaming response
//! generation, transition classification and variable extraction.
//!
//! Vendors implement these traits outside this crate; the engine only
//! depends on the contracts below.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::core::errors::CallErrorKind;
use crate::core::graph::VariableSpec;
use crate::core::session::Turn;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Generation request failed: {0}")]
    RequestFailed(String),

    #[error("Generation stream failed: {0}")]
    StreamFailed(String),

    #[error("Generation stalled for {0:?}")]
    Timeout(Duration),
}

impl GenerationError {
    pub fn kind(&self) -> CallErrorKind {
        CallErrorKind::GenerationFailure
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("Classifier request failed: {0}")]
    RequestFailed(String),

    #[error("Classifier returned an unusable answer: {0}")]
    InvalidResponse(String),
}

impl ClassifierError {
    pub fn kind(&self) -> CallErrorKind {
        CallErrorKind::EvaluationTimeout
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("Extraction request failed: {0}")]
    RequestFailed(String),
}

impl ExtractionError {
    pub fn kind(&self) -> CallErrorKind {
        CallErrorKind::GenerationFailure
    }
}

/// Everything a generator needs to produce the agent's next words.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub call_id: String,
    pub node_id: String,
    pub instructions: String,
    pub utterance: Option<String>,
    pub history: Vec<Turn>,
    pub variables: HashMap<String, String>,
}

pub type TextChunkStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<TextChunkStream, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub graph_id: String,
    pub node_id: String,
    pub utterance: String,
    /// Condition descriptions, in declaration order.
    pub candidates: Vec<String>,
    pub history: Vec<Turn>,
}

#[async_trait]
pub trait TransitionClassifier: Send + Sync {
    /// Index into `candidates`, or `None` when no condition applies.
    async fn classify(&self, request: ClassificationRequest) -> Result<Option<usize>, ClassifierError>;
}

#[async_trait]
pub trait VariableExtractor: Send + Sync {
    async fn extract(
        &self,
        utterance: &str,
        specs: &[VariableSpec],
        history: &[Turn],
    ) -> Result<HashMap<String, String>, ExtractionError>;
}
