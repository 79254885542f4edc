//! Picks the next conversation node from the caller's latest utterance.
//!
//! Evaluators run as a chain: the first one that reaches a decision wins and
//! the rest are skipped. Every failure inside an evaluator degrades to "no
//! match", which keeps the call on its current node.

mod rule;
mod semantic;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use rule::RuleEvaluator;
pub use semantic::SemanticEvaluator;

use crate::core::cache::CacheStore;
use crate::core::graph::{ConversationGraph, NodeIndex, Transition};
use crate::core::llm::TransitionClassifier;
use crate::core::session::Turn;
use crate::core::text;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TransitionConfig {
    pub semantic_timeout_ms: u64,
    pub cache_enabled: bool,
    pub cache_ttl_seconds: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            semantic_timeout_ms: 3000,
            cache_enabled: true,
            cache_ttl_seconds: 3600,
        }
    }
}

impl TransitionConfig {
    pub fn semantic_timeout(&self) -> Duration {
        Duration::from_millis(self.semantic_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Rule,
    Cache,
    Semantic,
    /// The semantic path failed or timed out.
    Degraded,
    /// No evaluator reached a decision.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionDecision {
    /// `None` means stay on the current node.
    pub target: Option<NodeIndex>,
    pub source: DecisionSource,
}

impl TransitionDecision {
    pub fn stay(source: DecisionSource) -> Self {
        Self {
            target: None,
            source,
        }
    }
}

/// One evaluator's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Decided(TransitionDecision),
    /// Defer to the next evaluator in the chain.
    Undecided,
}

/// Inputs shared by every evaluator for one utterance.
pub struct EvaluationContext<'a> {
    pub graph: &'a ConversationGraph,
    pub node: NodeIndex,
    pub utterance: &'a str,
    pub normalized: String,
    pub history: &'a [Turn],
    /// Transitions whose required variables are bound, in declaration order.
    pub candidates: Vec<&'a Transition>,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Verdict;
}

fn is_bound(variables: &HashMap<String, String>, name: &str) -> bool {
    variables.get(name).is_some_and(|v| !v.trim().is_empty())
}

/// The evaluator chain.
#[derive(Clone)]
pub struct TransitionEvaluator {
    chain: Vec<Arc<dyn Evaluator>>,
}

impl TransitionEvaluator {
    pub fn new(chain: Vec<Arc<dyn Evaluator>>) -> Self {
        Self { chain }
    }

    /// Rules first, then the classifier behind a timeout and the decision cache.
    pub fn standard(
        classifier: Arc<dyn TransitionClassifier>,
        cache: Option<Arc<CacheStore>>,
        config: &TransitionConfig,
    ) -> Self {
        let cache = cache.filter(|_| config.cache_enabled);
        Self::new(vec![
            Arc::new(RuleEvaluator),
            Arc::new(SemanticEvaluator::new(
                classifier,
                cache,
                config.semantic_timeout(),
                config.cache_ttl(),
            )),
        ])
    }

    pub async fn evaluate(
        &self,
        graph: &ConversationGraph,
        node: NodeIndex,
        utterance: &str,
        history: &[Turn],
        variables: &HashMap<String, String>,
    ) -> TransitionDecision {
        let current = graph.node(node);
        let candidates: Vec<&Transition> = current
            .transitions
            .iter()
            .filter(|t| t.required_variables.iter().all(|v| is_bound(variables, v)))
            .collect();

        let ctx = EvaluationContext {
            graph,
            node,
            utterance,
            normalized: text::normalize(utterance),
            history,
            candidates,
        };

        for evaluator in &self.chain {
            if let Verdict::Decided(decision) = evaluator.evaluate(&ctx).await {
                debug!(
                    graph = graph.id(),
                    node = %current.id,
                    evaluator = evaluator.name(),
                    source = ?decision.source,
                    target = ?decision.target.map(|t| graph.node(t).id.as_str()),
                    "Transition decided"
                );
                return decision;
            }
        }

        TransitionDecision::stay(DecisionSource::Fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::{ClassificationRequest, ClassifierError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(super) const GRAPH: &str = r#"
id: intake
start: ask
nodes:
  - id: ask
    kind: scripted
    template: "Would you like to book, cancel, or talk to someone?"
    transitions:
      - condition: caller wants to book an appointment
        target: book
        keywords: [book, schedule]
      - condition: caller wants to cancel
        target: cancel
        keywords: [cancel]
      - condition: caller asks for a human
        target: human
        keywords: [agent, human, representative]
      - condition: caller gave their member id
        target: verify
        required_variables: [member_id]
  - {id: book, kind: scripted, template: "Booking."}
  - {id: verify, kind: scripted, template: "Verifying."}
  - {id: cancel, kind: scripted, template: "Cancelling."}
  - {id: human, kind: terminal, message: "Transferring."}
"#;

    pub(super) struct ScriptedClassifier {
        pub answer: Result<Option<usize>, ClassifierError>,
        pub calls: AtomicUsize,
    }

    impl ScriptedClassifier {
        pub fn answering(answer: Result<Option<usize>, ClassifierError>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TransitionClassifier for ScriptedClassifier {
        async fn classify(
            &self,
            _request: ClassificationRequest,
        ) -> Result<Option<usize>, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    struct NeverAnswers;

    #[async_trait]
    impl TransitionClassifier for NeverAnswers {
        async fn classify(
            &self,
            _request: ClassificationRequest,
        ) -> Result<Option<usize>, ClassifierError> {
            std::future::pending().await
        }
    }

    fn graph() -> ConversationGraph {
        ConversationGraph::from_yaml_str(GRAPH).unwrap()
    }

    #[tokio::test]
    async fn test_keyword_rule_wins_without_classifier() {
        let graph = graph();
        let classifier = ScriptedClassifier::answering(Ok(Some(2)));
        let evaluator = TransitionEvaluator::standard(
            classifier.clone(),
            None,
            &TransitionConfig::default(),
        );

        let decision = evaluator
            .evaluate(&graph, graph.start(), "I'd like to cancel please", &[], &HashMap::new())
            .await;
        assert_eq!(decision.target, graph.lookup("cancel"));
        assert_eq!(decision.source, DecisionSource::Rule);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_semantic_decision_is_cached() {
        let graph = graph();
        let cache = Arc::new(CacheStore::in_memory(64));
        let classifier = ScriptedClassifier::answering(Ok(Some(0)));
        let evaluator = TransitionEvaluator::standard(
            classifier.clone(),
            Some(cache),
            &TransitionConfig::default(),
        );

        let cold = evaluator
            .evaluate(&graph, graph.start(), "I need to see a doctor next week", &[], &HashMap::new())
            .await;
        let warm = evaluator
            .evaluate(&graph, graph.start(), "I need to see a doctor next week!", &[], &HashMap::new())
            .await;

        assert_eq!(cold.target, graph.lookup("book"));
        assert_eq!(cold.source, DecisionSource::Semantic);
        assert_eq!(warm.target, cold.target);
        assert_eq!(warm.source, DecisionSource::Cache);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_that_never_returns_stays() {
        let graph = graph();
        let evaluator = TransitionEvaluator::standard(
            Arc::new(NeverAnswers),
            Some(Arc::new(CacheStore::in_memory(64))),
            &TransitionConfig::default(),
        );

        let decision = evaluator
            .evaluate(&graph, graph.start(), "what's the weather like", &[], &HashMap::new())
            .await;
        assert_eq!(decision.target, None);
        assert_eq!(decision.source, DecisionSource::Degraded);
    }

    #[tokio::test]
    async fn test_classifier_error_and_out_of_range_stay() {
        let graph = graph();
        for answer in [
            Err(ClassifierError::RequestFailed("503".to_string())),
            Ok(Some(17)),
        ] {
            let evaluator = TransitionEvaluator::standard(
                ScriptedClassifier::answering(answer),
                None,
                &TransitionConfig::default(),
            );
            let decision = evaluator
                .evaluate(&graph, graph.start(), "hmm let me think about it", &[], &HashMap::new())
                .await;
            assert_eq!(decision.target, None);
        }
    }

    #[tokio::test]
    async fn test_required_variables_filter_candidates() {
        let graph = graph();
        let classifier = ScriptedClassifier::answering(Ok(Some(3)));
        let evaluator =
            TransitionEvaluator::standard(classifier.clone(), None, &TransitionConfig::default());

        // member_id unbound: only three candidates, index 3 is out of range.
        let unbound = evaluator
            .evaluate(&graph, graph.start(), "my number is 1234", &[], &HashMap::new())
            .await;
        assert_eq!(unbound.target, None);

        let bound = HashMap::from([("member_id".to_string(), "1234".to_string())]);
        let decision = evaluator
            .evaluate(&graph, graph.start(), "my number is 1234", &[], &bound)
            .await;
        assert_eq!(decision.target, graph.lookup("verify"));
    }

    #[tokio::test]
    async fn test_cached_decision_respects_variable_gates() {
        let graph = graph();
        let cache = Arc::new(CacheStore::in_memory(64));
        let utterance = "it's the one on my card";

        // A call that has the member id: the classifier picks the gated transition.
        let bound = HashMap::from([("member_id".to_string(), "1234".to_string())]);
        let gated = TransitionEvaluator::standard(
            ScriptedClassifier::answering(Ok(Some(3))),
            Some(Arc::clone(&cache)),
            &TransitionConfig::default(),
        );
        let first = gated
            .evaluate(&graph, graph.start(), utterance, &[], &bound)
            .await;
        assert_eq!(first.target, graph.lookup("verify"));
        assert_eq!(first.source, DecisionSource::Semantic);

        // Another call on the same cache without it must not be routed there.
        let classifier = ScriptedClassifier::answering(Ok(None));
        let ungated = TransitionEvaluator::standard(
            classifier.clone(),
            Some(Arc::clone(&cache)),
            &TransitionConfig::default(),
        );
        let second = ungated
            .evaluate(&graph, graph.start(), utterance, &[], &HashMap::new())
            .await;
        assert_eq!(second.target, None);
        assert_eq!(second.source, DecisionSource::Semantic);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);

        // The gated call still gets its own cached answer.
        let again = gated
            .evaluate(&graph, graph.start(), utterance, &[], &bound)
            .await;
        assert_eq!(again.target, graph.lookup("verify"));
        assert_eq!(again.source, DecisionSource::Cache);
    }

    #[tokio::test]
    async fn test_node_without_transitions_stays() {
        let graph = graph();
        let classifier = ScriptedClassifier::answering(Ok(Some(0)));
        let evaluator =
            TransitionEvaluator::standard(classifier.clone(), None, &TransitionConfig::default());

        let decision = evaluator
            .evaluate(&graph, graph.lookup("book").unwrap(), "anything", &[], &HashMap::new())
            .await;
        assert_eq!(decision, TransitionDecision::stay(DecisionSource::Rule));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }
}
