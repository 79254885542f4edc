//! Turns the current node into speakable fragments.
//!
//! Fragments go out through a bounded channel as soon as they are complete,
//! so the audio side can synthesize fragment N while fragment N+1 is still
//! being generated.

mod pipeline;
mod sentence;
pub mod template;

pub use pipeline::{
    Fragment, FragmentSink, ResponseConfig, ResponseOutcome, ResponsePipeline, ResponseRequest,
    WebhookOutcome,
};
pub use sentence::SentenceSplitter;
