//! Telephony playback transport.
//!
//! The transport plays audio to the caller and reports `started`/`ended` for
//! each unit, either directly to the hosting session or over HTTP to any
//! worker (`POST /calls/{call_id}/playback`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::audio::PlaybackUnit;
use crate::core::errors::CallErrorKind;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport disconnected: {0}")]
    Disconnected(String),

    #[error("Playback failed: {0}")]
    PlaybackFailed(String),
}

impl TransportError {
    pub fn kind(&self) -> CallErrorKind {
        CallErrorKind::SynthesisFailure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEventKind {
    Started,
    Ended,
}

#[async_trait]
pub trait PlaybackTransport: Send + Sync {
    /// Hand a unit to the caller's audio path. Returns once the transport has
    /// accepted it, not once it has finished playing.
    async fn play(&self, unit: &PlaybackUnit) -> Result<(), TransportError>;

    /// Cut off whatever is playing right now.
    async fn stop_playback(&self) -> Result<(), TransportError>;
}
