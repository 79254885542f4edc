//! Error taxonomy for call-level failures.
//!
//! Every component keeps its own `thiserror` enum (see `StateStoreError`,
//! `SynthesisError`, `GenerationError`, ...) and maps it onto one of the kinds
//! below. The kind decides how the call degrades; it never decides whether the
//! process survives, because no call-level error is allowed to escape a call.

use std::fmt;

use serde::Serialize;
use tracing::{error, warn};

/// The closed set of failure kinds a call can run into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    /// Semantic transition evaluation did not answer in time. The call stays on
    /// the current node.
    EvaluationTimeout,
    /// Response generation failed. Retried once, then replaced by a filler.
    GenerationFailure,
    /// Speech synthesis failed for one fragment. The fragment is skipped.
    SynthesisFailure,
    /// A side-effecting webhook failed or timed out. The failure branch is taken.
    WebhookFailure,
    /// The speech recognizer could not be started for a call.
    RecognizerFailure,
    /// The shared state store could not be reached. Local-only behavior.
    StateStoreUnavailable,
    /// A cross-process notification referenced a call this process does not host.
    SessionNotFound,
}

impl CallErrorKind {
    /// Whether this kind signals a system-level condition that needs monitoring
    /// rather than a per-call degradation.
    pub fn is_system_level(self) -> bool {
        matches!(self, Self::StateStoreUnavailable | Self::SessionNotFound)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EvaluationTimeout => "evaluation_timeout",
            Self::GenerationFailure => "generation_failure",
            Self::SynthesisFailure => "synthesis_failure",
            Self::WebhookFailure => "webhook_failure",
            Self::RecognizerFailure => "recognizer_failure",
            Self::StateStoreUnavailable => "state_store_unavailable",
            Self::SessionNotFound => "session_not_found",
        }
    }
}

impl fmt::Display for CallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log a degraded path at the level its kind warrants.
pub fn report_degraded(call_id: &str, kind: CallErrorKind, detail: &dyn fmt::Display) {
    if kind.is_system_level() {
        error!(
            call_id = %call_id,
            kind = %kind,
            system_level = true,
            "{}",
            detail
        );
    } else {
        warn!(call_id = %call_id, kind = %kind, "{}", detail);
    }
}
