use async_trait::async_trait;

use super::{DecisionSource, EvaluationContext, Evaluator, TransitionDecision, Verdict};
use crate::core::graph::Transition;
use crate::core::text;

/// Deterministic shortcuts that never leave the process.
///
/// In declaration order, a transition matches when the normalized utterance
/// equals its condition or one of its keywords, or contains a keyword as a
/// whole-word phrase. With no match and exactly one candidate left, that
/// candidate is taken. With no candidates at all the call stays.
pub struct RuleEvaluator;

fn transition_matches(transition: &Transition, normalized: &str, words: &[String]) -> bool {
    if text::normalize(&transition.condition) == normalized {
        return true;
    }
    transition.keywords.iter().any(|keyword| {
        let keyword_words = text::words(keyword);
        keyword_words.join(" ") == normalized || text::contains_phrase(words, &keyword_words)
    })
}

#[async_trait]
impl Evaluator for RuleEvaluator {
    fn name(&self) -> &'static str {
        "rule"
    }

    async fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Verdict {
        let rule = |target| {
            Verdict::Decided(TransitionDecision {
                target,
                source: DecisionSource::Rule,
            })
        };

        match ctx.candidates.as_slice() {
            [] => rule(None),
            [only] => rule(Some(only.target)),
            candidates => {
                let words: Vec<String> = ctx.normalized.split(' ').map(str::to_string).collect();
                candidates
                    .iter()
                    .find(|t| transition_matches(t, &ctx.normalized, &words))
                    .map_or(Verdict::Undecided, |t| rule(Some(t.target)))
            }
        }
    }
}
