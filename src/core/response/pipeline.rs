use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sentence::SentenceSplitter;
use super::template::render;
use crate::core::coordinator::CallStateHandle;
use crate::core::errors::{CallErrorKind, report_degraded};
use crate::core::graph::{ConversationNode, NodeKind, VariableSpec};
use crate::core::llm::{GenerationError, GenerationRequest, ResponseGenerator, VariableExtractor};
use crate::core::session::{Disposition, Turn};
use crate::core::webhook::{WebhookError, WebhookExecutor, WebhookSpec};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ResponseConfig {
    /// How long to wait for a generator's first chunk.
    pub first_chunk_timeout_ms: u64,
    /// How long to wait between later chunks.
    pub chunk_timeout_ms: u64,
    pub extraction_timeout_ms: u64,
    /// Used when a webhook node does not set its own timeout.
    pub webhook_timeout_ms: u64,
    /// Spoken when generation fails and nothing better can be said.
    pub fallback_message: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            first_chunk_timeout_ms: 5000,
            chunk_timeout_ms: 5000,
            extraction_timeout_ms: 3000,
            webhook_timeout_ms: 30_000,
            fallback_message: "I'm sorry, I didn't quite catch that. Could you say it again?"
                .to_string(),
        }
    }
}

impl ResponseConfig {
    pub fn first_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.first_chunk_timeout_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }
}

/// One speakable piece of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    /// First fragment of the turn. Its synthesis failing is replaced by an
    /// apology rather than skipped.
    pub first: bool,
}

/// Producer end of a turn's fragment channel.
///
/// Tracks what has been handed to the audio side so the session can record
/// the agent's turn and the generator retry logic knows whether anything was
/// said yet.
pub struct FragmentSink {
    tx: mpsc::Sender<Fragment>,
    cancel: CancellationToken,
    spoken: Vec<String>,
}

impl FragmentSink {
    pub fn new(tx: mpsc::Sender<Fragment>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            spoken: Vec::new(),
        }
    }

    /// Returns false once the turn is cancelled or the consumer is gone.
    pub async fn emit(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        let text = text.trim();
        if text.is_empty() {
            return !self.cancel.is_cancelled();
        }
        let fragment = Fragment {
            text: text.to_string(),
            first: self.spoken.is_empty(),
        };
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(fragment) => sent.is_ok(),
        };
        if sent {
            self.spoken.push(text.to_string());
        }
        sent
    }

    pub fn emitted(&self) -> usize {
        self.spoken.len()
    }

    pub fn spoken(&self) -> &[String] {
        &self.spoken
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// How a webhook node's request went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Success,
    Failure,
}

impl WebhookOutcome {
    /// Synthetic utterance fed back into transition evaluation.
    pub fn as_utterance(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// What speaking one node produced, beyond the fragments themselves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseOutcome {
    /// Values to merge into the call's variables.
    pub bindings: HashMap<String, String>,
    /// The node re-prompted for missing variables and must not advance.
    pub reprompted: bool,
    pub webhook: Option<WebhookOutcome>,
    /// Set by terminal nodes: end the call once playback drains.
    pub terminate: Option<Disposition>,
}

/// Inputs for speaking one node.
pub struct ResponseRequest<'a> {
    pub call_id: &'a str,
    pub node: &'a ConversationNode,
    /// The caller's latest words, when the node is spoken in reply to them.
    pub utterance: Option<&'a str>,
    /// True when the node has just become current; false when the call
    /// stayed on it.
    pub entering: bool,
    pub history: &'a [Turn],
    pub variables: &'a HashMap<String, String>,
    pub shared: &'a CallStateHandle,
}

enum StreamFailure {
    Interrupted,
    Failed(GenerationError),
}

/// Turns the current node into fragments.
pub struct ResponsePipeline {
    generator: Arc<dyn ResponseGenerator>,
    extractor: Arc<dyn VariableExtractor>,
    webhooks: Arc<dyn WebhookExecutor>,
    config: ResponseConfig,
}

impl ResponsePipeline {
    pub fn new(
        generator: Arc<dyn ResponseGenerator>,
        extractor: Arc<dyn VariableExtractor>,
        webhooks: Arc<dyn WebhookExecutor>,
        config: ResponseConfig,
    ) -> Self {
        Self {
            generator,
            extractor,
            webhooks,
            config,
        }
    }

    pub fn config(&self) -> &ResponseConfig {
        &self.config
    }

    /// Bind variables from the caller's answer. Failures bind nothing.
    pub async fn extract(
        &self,
        call_id: &str,
        specs: &[VariableSpec],
        utterance: &str,
        history: &[Turn],
    ) -> HashMap<String, String> {
        if specs.is_empty() {
            return HashMap::new();
        }
        let attempt = tokio::time::timeout(
            self.config.extraction_timeout(),
            self.extractor.extract(utterance, specs, history),
        )
        .await;

        match attempt {
            Ok(Ok(mut values)) => {
                values.retain(|name, value| {
                    !value.trim().is_empty() && specs.iter().any(|s| &s.name == name)
                });
                debug!(call_id, bound = values.len(), "Variables extracted");
                values
            }
            Ok(Err(e)) => {
                report_degraded(call_id, e.kind(), &e);
                HashMap::new()
            }
            Err(_) => {
                report_degraded(
                    call_id,
                    CallErrorKind::GenerationFailure,
                    &"Variable extraction timed out",
                );
                HashMap::new()
            }
        }
    }

    /// Speak `request.node` into `sink`.
    pub async fn respond(
        &self,
        request: &ResponseRequest<'_>,
        sink: &mut FragmentSink,
    ) -> ResponseOutcome {
        let node = request.node;
        debug!(
            call_id = request.call_id,
            node = %node.id,
            kind = node.kind.name(),
            entering = request.entering,
            "Responding"
        );

        match &node.kind {
            NodeKind::Scripted { template } => {
                sink.emit(render(template, request.variables)).await;
                ResponseOutcome::default()
            }
            NodeKind::Generated { instructions } => {
                self.generate(request, instructions, sink).await;
                ResponseOutcome::default()
            }
            NodeKind::Extract {
                variables,
                reprompt,
                template,
                instructions,
            } => {
                let missing: Vec<&str> = variables
                    .iter()
                    .filter(|v| !v.is_satisfied_by(request.variables))
                    .map(|v| v.name.as_str())
                    .collect();

                if !missing.is_empty() && !request.entering {
                    debug!(call_id = request.call_id, node = %node.id, ?missing, "Re-prompting");
                    sink.emit(render(reprompt, request.variables)).await;
                    return ResponseOutcome {
                        reprompted: true,
                        ..ResponseOutcome::default()
                    };
                }
                if let Some(template) = template {
                    sink.emit(render(template, request.variables)).await;
                } else if let Some(instructions) = instructions {
                    self.generate(request, instructions, sink).await;
                }
                ResponseOutcome::default()
            }
            NodeKind::Webhook {
                request: spec,
                pre_message,
                success_message,
                failure_message,
                result_variable,
                timeout_ms,
            } => {
                if let Some(pre) = pre_message
                    && !sink.emit(render(pre, request.variables)).await
                {
                    return ResponseOutcome::default();
                }
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.config.webhook_timeout());
                self.call_webhook(
                    request,
                    spec,
                    timeout,
                    result_variable.as_deref(),
                    success_message,
                    failure_message,
                    sink,
                )
                .await
            }
            NodeKind::Terminal {
                message,
                disposition,
            } => {
                sink.emit(render(message, request.variables)).await;
                ResponseOutcome {
                    terminate: Some(disposition.unwrap_or(Disposition::Completed)),
                    ..ResponseOutcome::default()
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_webhook(
        &self,
        request: &ResponseRequest<'_>,
        spec: &WebhookSpec,
        timeout: Duration,
        result_variable: Option<&str>,
        success_message: &str,
        failure_message: &str,
        sink: &mut FragmentSink,
    ) -> ResponseOutcome {
        let rendered = spec.render(request.variables);
        let guard = request.shared.webhook_guard().await;
        let attempt = tokio::select! {
            biased;
            _ = sink.cancel_token().cancelled() => None,
            attempt = tokio::time::timeout(timeout, self.webhooks.execute(rendered)) => Some(attempt),
        };
        guard.release().await;

        let Some(attempt) = attempt else {
            debug!(call_id = request.call_id, "Webhook abandoned by interruption");
            return ResponseOutcome::default();
        };
        let result = attempt.unwrap_or(Err(WebhookError::Timeout(timeout)));

        let mut outcome = ResponseOutcome::default();
        let mut variables = request.variables.clone();
        let message = match result {
            Ok(response) => {
                info!(
                    call_id = request.call_id,
                    node = %request.node.id,
                    status = response.status,
                    "Webhook succeeded"
                );
                if let Some(prefix) = result_variable {
                    outcome.bindings = response.bindings(prefix);
                    variables.extend(outcome.bindings.clone());
                }
                outcome.webhook = Some(WebhookOutcome::Success);
                success_message
            }
            Err(e) => {
                report_degraded(request.call_id, e.kind(), &e);
                outcome.webhook = Some(WebhookOutcome::Failure);
                failure_message
            }
        };
        sink.emit(render(message, &variables)).await;
        outcome
    }

    /// Stream a generated reply, retrying once if nothing was said yet.
    async fn generate(
        &self,
        request: &ResponseRequest<'_>,
        instructions: &str,
        sink: &mut FragmentSink,
    ) {
        let generation = GenerationRequest {
            call_id: request.call_id.to_string(),
            node_id: request.node.id.clone(),
            instructions: render(instructions, request.variables),
            utterance: request.utterance.map(str::to_string),
            history: request.history.to_vec(),
            variables: request.variables.clone(),
        };

        let before = sink.emitted();
        for attempt in 1..=2 {
            match self.stream_once(generation.clone(), sink).await {
                Ok(()) | Err(StreamFailure::Interrupted) => return,
                Err(StreamFailure::Failed(e)) => {
                    report_degraded(request.call_id, e.kind(), &e);
                    if sink.emitted() > before || attempt == 2 {
                        break;
                    }
                    debug!(call_id = request.call_id, "Retrying generation");
                }
            }
        }
        sink.emit(self.config.fallback_message.clone()).await;
    }

    async fn stream_once(
        &self,
        request: GenerationRequest,
        sink: &mut FragmentSink,
    ) -> Result<(), StreamFailure> {
        let cancel = sink.cancel_token().clone();
        let first_wait = self.config.first_chunk_timeout();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamFailure::Interrupted),
            opened = tokio::time::timeout(first_wait, self.generator.generate(request)) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(StreamFailure::Failed(e)),
            Err(_) => return Err(StreamFailure::Failed(GenerationError::Timeout(first_wait))),
        };

        let mut splitter = SentenceSplitter::new();
        let mut wait = first_wait;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamFailure::Interrupted),
                next = tokio::time::timeout(wait, stream.next()) => next,
            };
            match next {
                Err(_) => {
                    warn!(pending = splitter.pending(), "Generation stalled");
                    return Err(StreamFailure::Failed(GenerationError::Timeout(wait)));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(StreamFailure::Failed(e)),
                Ok(Some(Ok(chunk))) => {
                    wait = self.config.chunk_timeout();
                    for sentence in splitter.push(&chunk) {
                        if !sink.emit(sentence).await {
                            return Err(StreamFailure::Interrupted);
                        }
                    }
                }
            }
        }

        if let Some(rest) = splitter.finish()
            && !sink.emit(rest).await
        {
            return Err(StreamFailure::Interrupted);
        }
        Ok(())
    }
}
