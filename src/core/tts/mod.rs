//! Speech synthesis capability and its HTTP adapters.

mod base;
mod deepgram;
mod http;

pub use base::{
    Pronunciation, SpeechSynthesizer, SynthesisError, SynthesisResult, SynthesizedAudio,
    SynthesizerConfig,
};
pub use deepgram::{DEEPGRAM_SPEAK_URL, DeepgramRequestBuilder};
pub use http::{HttpSynthesizer, PronunciationReplacer, SynthesisRequestBuilder};
