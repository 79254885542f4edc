//! Speech recognition capability.

mod base;

pub use base::{STTError, STTResult, SpeechRecognizer, TranscriptEvent};
