use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::audio::AudioConfig;
use crate::core::dead_air::DeadAirConfig;
use crate::core::interruption::InterruptionConfig;
use crate::core::llm::{ResponseGenerator, TransitionClassifier, VariableExtractor};
use crate::core::response::ResponseConfig;
use crate::core::transition::TransitionConfig;
use crate::core::transport::PlaybackTransport;
use crate::core::tts::SpeechSynthesizer;
use crate::core::webhook::WebhookExecutor;

/// Engine settings shared by every call a process hosts.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    pub transition: TransitionConfig,
    pub response: ResponseConfig,
    pub audio: AudioConfig,
    pub interruption: InterruptionConfig,
    pub dead_air: DeadAirConfig,
    /// A final transcript containing one of these ends the call as
    /// `voicemail-detected`.
    pub voicemail_phrases: Vec<String>,
    /// A final transcript containing one of these switches dead-air
    /// monitoring to the hold threshold.
    pub hold_phrases: Vec<String>,
    /// Webhook results chained through transitions within one turn.
    pub max_webhook_hops: u32,
    pub fragment_channel_capacity: usize,
    pub event_channel_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        let phrases =
            |list: &[&str]| -> Vec<String> { list.iter().map(|p| p.to_string()).collect() };
        Self {
            transition: TransitionConfig::default(),
            response: ResponseConfig::default(),
            audio: AudioConfig::default(),
            interruption: InterruptionConfig::default(),
            dead_air: DeadAirConfig::default(),
            voicemail_phrases: phrases(&[
                "leave a message",
                "leave your message",
                "after the tone",
                "after the beep",
                "is not available",
                "voicemail",
                "mailbox",
            ]),
            hold_phrases: phrases(&[
                "hold on",
                "hang on",
                "one moment",
                "one second",
                "just a second",
                "just a minute",
                "give me a minute",
                "wait a minute",
            ]),
            max_webhook_hops: 4,
            fragment_channel_capacity: 8,
            event_channel_capacity: 64,
        }
    }
}

/// The external services one call talks to. The recognizer is per call and
/// is handed to [`CallSession::spawn`](super::CallSession::spawn) separately.
#[derive(Clone)]
pub struct CallCapabilities {
    pub generator: Arc<dyn ResponseGenerator>,
    pub classifier: Arc<dyn TransitionClassifier>,
    pub extractor: Arc<dyn VariableExtractor>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub transport: Arc<dyn PlaybackTransport>,
    pub webhooks: Arc<dyn WebhookExecutor>,
}
