//! Barge-in detection: telling a caller talking over the agent apart from
//! the agent's own audio echoing back.

mod echo;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use echo::EchoFilter;

use crate::core::text;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct InterruptionConfig {
    /// Share of a partial's words found in recent agent speech at which the
    /// partial counts as echo.
    pub echo_overlap_threshold: f32,
    /// Words a non-echo partial needs before it interrupts the agent.
    pub min_words: usize,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            echo_overlap_threshold: 0.3,
            min_words: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakingState {
    AgentSpeaking,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BargeInDecision {
    /// The agent is silent; partials are ordinary input.
    NotSpeaking,
    Echo { overlap: f32 },
    BelowThreshold { words: usize },
    /// The caller is talking over the agent. Output must stop.
    Interrupt,
}

#[derive(Debug)]
pub struct InterruptionDetector {
    config: InterruptionConfig,
    echo: EchoFilter,
    state: SpeakingState,
}

impl InterruptionDetector {
    pub fn new(config: InterruptionConfig) -> Self {
        Self {
            echo: EchoFilter::new(config.echo_overlap_threshold),
            config,
            state: SpeakingState::Idle,
        }
    }

    pub fn state(&self) -> SpeakingState {
        self.state
    }

    pub fn set_state(&mut self, state: SpeakingState) {
        self.state = state;
    }

    pub fn is_echo(&self, text: &str, recent_speech: &[String]) -> bool {
        self.echo.check(text, recent_speech).is_some()
    }

    /// Judge one partial transcript against what the agent recently said.
    /// An interruption moves the detector to `Idle`.
    pub fn on_partial(&mut self, partial: &str, recent_speech: &[String]) -> BargeInDecision {
        if self.state == SpeakingState::Idle {
            return BargeInDecision::NotSpeaking;
        }

        if let Some(overlap) = self.echo.check(partial, recent_speech) {
            debug!(overlap, "Partial transcript is echo");
            return BargeInDecision::Echo { overlap };
        }

        let words = text::words(partial).len();
        if words < self.config.min_words {
            return BargeInDecision::BelowThreshold { words };
        }

        self.state = SpeakingState::Idle;
        BargeInDecision::Interrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speaking() -> InterruptionDetector {
        let mut detector = InterruptionDetector::new(InterruptionConfig::default());
        detector.set_state(SpeakingState::AgentSpeaking);
        detector
    }

    fn recent() -> Vec<String> {
        vec!["We have openings on Monday morning and Thursday afternoon.".to_string()]
    }

    #[test]
    fn test_idle_never_interrupts() {
        let mut detector = InterruptionDetector::new(InterruptionConfig::default());
        assert_eq!(
            detector.on_partial("hold on a second", &recent()),
            BargeInDecision::NotSpeaking
        );
    }

    #[test]
    fn test_echo_mid_speech_is_ignored() {
        let mut detector = speaking();
        let decision = detector.on_partial("openings on Monday morning and Thursday", &recent());
        assert!(matches!(decision, BargeInDecision::Echo { overlap } if overlap >= 0.9));
        assert_eq!(detector.state(), SpeakingState::AgentSpeaking);
    }

    #[test]
    fn test_new_words_interrupt() {
        let mut detector = speaking();
        assert_eq!(
            detector.on_partial("actually wait", &recent()),
            BargeInDecision::Interrupt
        );
        assert_eq!(detector.state(), SpeakingState::Idle);
    }

    #[test]
    fn test_single_word_is_below_threshold() {
        let mut detector = speaking();
        assert_eq!(
            detector.on_partial("wait", &recent()),
            BargeInDecision::BelowThreshold { words: 1 }
        );
        assert_eq!(detector.state(), SpeakingState::AgentSpeaking);
    }
}
