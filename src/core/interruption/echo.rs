use std::collections::HashSet;

use crate::core::text;

/// Decides whether a partial transcript is the agent's own voice leaking
/// back through the caller's microphone.
#[derive(Debug, Clone, Copy)]
pub struct EchoFilter {
    threshold: f32,
}

impl EchoFilter {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// The overlap ratio when `partial` looks like echo of `recent`.
    pub fn check(&self, partial: &str, recent: &[String]) -> Option<f32> {
        let words = text::words(partial);
        if words.is_empty() || recent.is_empty() {
            return None;
        }
        let normalized = words.join(" ");

        let agent: Vec<Vec<String>> = recent.iter().map(|r| text::words(r)).collect();
        let vocabulary: HashSet<&str> = agent.iter().flatten().map(String::as_str).collect();

        let distinct: HashSet<&str> = words.iter().map(String::as_str).collect();
        let shared = distinct.iter().filter(|w| vocabulary.contains(*w)).count();
        let overlap = shared as f32 / distinct.len() as f32;

        if overlap >= self.threshold {
            return Some(overlap);
        }
        let contained = agent
            .iter()
            .any(|fragment| fragment.join(" ").contains(&normalized));
        if contained || shares_trigram(&words, &agent) {
            return Some(overlap);
        }
        None
    }
}

fn shares_trigram(words: &[String], agent: &[Vec<String>]) -> bool {
    words
        .windows(3)
        .any(|trigram| agent.iter().any(|fragment| text::contains_phrase(fragment, trigram)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recent() -> Vec<String> {
        vec![
            "Your appointment is on Tuesday at nine.".to_string(),
            "Is there anything else I can help with?".to_string(),
        ]
    }

    #[test]
    fn test_high_overlap_is_echo() {
        let filter = EchoFilter::new(0.3);
        let overlap = filter.check("anything else I can help", &recent()).unwrap();
        assert!(overlap >= 0.9);
    }

    #[test]
    fn test_unrelated_speech_is_not_echo() {
        let filter = EchoFilter::new(0.3);
        assert_eq!(filter.check("wait stop please", &recent()), None);
    }

    #[test]
    fn test_shared_trigram_below_threshold_is_echo() {
        let filter = EchoFilter::new(0.9);
        assert!(
            filter
                .check("no no on tuesday at nine works badly", &recent())
                .is_some()
        );
    }

    #[test]
    fn test_substring_of_fragment_is_echo() {
        let filter = EchoFilter::new(1.1);
        assert!(filter.check("Tuesday at", &recent()).is_some());
    }

    #[test]
    fn test_nothing_to_compare() {
        let filter = EchoFilter::new(0.3);
        assert_eq!(filter.check("hello there", &[]), None);
        assert_eq!(filter.check("  ", &recent()), None);
    }
}
