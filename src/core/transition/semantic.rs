use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DecisionSource, EvaluationContext, Evaluator, TransitionDecision, Verdict};
use crate::core::cache::CacheStore;
use crate::core::errors::CallErrorKind;
use crate::core::llm::{ClassificationRequest, TransitionClassifier};

const NAMESPACE: &str = "transition";

/// Cached outcome, stored by node id so it survives graph reloads that keep
/// ids stable.
#[derive(Debug, Serialize, Deserialize)]
struct CachedDecision {
    target: Option<String>,
}

/// Asks the classifier which condition the utterance satisfies.
///
/// Bounded by a timeout; a timeout, an error or an out-of-range answer all
/// mean "stay". Only real classifier answers are cached.
pub struct SemanticEvaluator {
    classifier: Arc<dyn TransitionClassifier>,
    cache: Option<Arc<CacheStore>>,
    timeout: Duration,
    cache_ttl: Duration,
}

impl SemanticEvaluator {
    pub fn new(
        classifier: Arc<dyn TransitionClassifier>,
        cache: Option<Arc<CacheStore>>,
        timeout: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            classifier,
            cache,
            timeout,
            cache_ttl,
        }
    }

    /// The classifier only chose among the eligible transitions, so the set
    /// it saw is part of the key: calls with different bindings never share
    /// an answer.
    fn cache_key(ctx: &EvaluationContext<'_>) -> String {
        let eligible: Vec<&str> = ctx
            .candidates
            .iter()
            .map(|t| t.condition.as_str())
            .collect();
        format!(
            "{}:{}:[{}]:{}",
            ctx.graph.id(),
            ctx.graph.node(ctx.node).id,
            eligible.join("|"),
            ctx.normalized
        )
    }

    async fn cached(&self, ctx: &EvaluationContext<'_>, key: &str) -> Option<TransitionDecision> {
        let cache = self.cache.as_ref()?;
        let entry = match cache.get_json::<CachedDecision>(NAMESPACE, key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(error = %e, "Transition cache read failed");
                return None;
            }
        };
        let target = match entry.target {
            None => None,
            // A target that no longer resolves, or is not eligible now, is a miss.
            Some(id) => {
                let target = ctx.graph.lookup(&id)?;
                if !ctx.candidates.iter().any(|t| t.target == target) {
                    return None;
                }
                Some(target)
            }
        };
        Some(TransitionDecision {
            target,
            source: DecisionSource::Cache,
        })
    }

    async fn remember(&self, ctx: &EvaluationContext<'_>, key: &str, decision: &TransitionDecision) {
        let Some(cache) = &self.cache else {
            return;
        };
        let entry = CachedDecision {
            target: decision.target.map(|t| ctx.graph.node(t).id.clone()),
        };
        if let Err(e) = cache
            .put_json(NAMESPACE, key, &entry, Some(self.cache_ttl))
            .await
        {
            warn!(error = %e, "Transition cache write failed");
        }
    }
}

#[async_trait]
impl Evaluator for SemanticEvaluator {
    fn name(&self) -> &'static str {
        "semantic"
    }

    async fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Verdict {
        let key = Self::cache_key(ctx);
        if let Some(decision) = self.cached(ctx, &key).await {
            return Verdict::Decided(decision);
        }

        let node_id = &ctx.graph.node(ctx.node).id;
        let request = ClassificationRequest {
            graph_id: ctx.graph.id().to_string(),
            node_id: node_id.clone(),
            utterance: ctx.utterance.to_string(),
            candidates: ctx.candidates.iter().map(|t| t.condition.clone()).collect(),
            history: ctx.history.to_vec(),
        };

        let answer = match tokio::time::timeout(self.timeout, self.classifier.classify(request)).await
        {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!(node = %node_id, kind = %e.kind(), error = %e, "Classifier failed, staying");
                return Verdict::Decided(TransitionDecision::stay(DecisionSource::Degraded));
            }
            Err(_) => {
                warn!(
                    node = %node_id,
                    kind = %CallErrorKind::EvaluationTimeout,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Classifier timed out, staying"
                );
                return Verdict::Decided(TransitionDecision::stay(DecisionSource::Degraded));
            }
        };

        let target = match answer {
            Some(index) => match ctx.candidates.get(index) {
                Some(transition) => Some(transition.target),
                None => {
                    warn!(node = %node_id, index, "Classifier answer out of range, staying");
                    return Verdict::Decided(TransitionDecision::stay(DecisionSource::Degraded));
                }
            },
            None => None,
        };

        let decision = TransitionDecision {
            target,
            source: DecisionSource::Semantic,
        };
        debug!(node = %node_id, target = ?target, "Classifier decided");
        self.remember(ctx, &key, &decision).await;
        Verdict::Decided(decision)
    }
}
