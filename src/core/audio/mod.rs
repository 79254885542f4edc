//! Ordered audio output for one call.
//!
//! Fragments are synthesized concurrently but played strictly in the order
//! they were enqueued: each fragment gets a slot in a FIFO of pending units,
//! and a single consumer task waits for unit N to finish playing before it
//! hands unit N+1 to the transport.

mod pipeline;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use pipeline::AudioPipeline;

use crate::core::tts::SynthesizedAudio;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Units that may wait for playback at once.
    pub queue_capacity: usize,
    pub max_concurrent_synthesis: usize,
    pub synthesis_timeout_ms: u64,
    /// Added to a unit's expected duration before giving up on its
    /// completion callback.
    pub playback_grace_ms: u64,
    /// How often the shared playback set is checked for completions
    /// delivered to another worker.
    pub completion_poll_ms: u64,
    /// Duration estimate for formats whose length can't be computed.
    pub estimated_ms_per_char: u64,
    /// Spoken when the first fragment of a response cannot be synthesized.
    pub apology_text: String,
    /// Agent fragments kept for echo detection.
    pub recent_fragments: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            max_concurrent_synthesis: 3,
            synthesis_timeout_ms: 5000,
            playback_grace_ms: 1500,
            completion_poll_ms: 250,
            estimated_ms_per_char: 65,
            apology_text: "Sorry, just a moment.".to_string(),
            recent_fragments: 3,
        }
    }
}

impl AudioConfig {
    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    pub fn playback_grace(&self) -> Duration {
        Duration::from_millis(self.playback_grace_ms)
    }

    pub fn completion_poll(&self) -> Duration {
        Duration::from_millis(self.completion_poll_ms)
    }

    /// Rough speaking time for `text`, never under half a second.
    pub fn estimate(&self, text: &str) -> Duration {
        let chars = text.chars().count() as u64;
        Duration::from_millis((chars * self.estimated_ms_per_char).max(500))
    }
}

/// One synthesized fragment on its way to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    /// Identifies the unit in the shared playback set and in transport
    /// callbacks.
    pub unit_id: String,
    /// Position in the call's output order.
    pub seq: u64,
    pub text: String,
    pub audio: SynthesizedAudio,
    pub expected_duration: Duration,
}

impl PlaybackUnit {
    pub fn new(seq: u64, text: impl Into<String>, audio: SynthesizedAudio, fallback: Duration) -> Self {
        let expected_duration = audio.duration().unwrap_or(fallback);
        Self {
            unit_id: Uuid::new_v4().simple().to_string(),
            seq,
            text: text.into(),
            audio,
            expected_duration,
        }
    }
}
