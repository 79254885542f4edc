//! HTTP request handlers
//!
//! - `api` - Health check endpoint
//! - `calls` - Playback callbacks and call inspection
//! - `state` - Shared call-state operations for other workers

pub mod api;
pub mod calls;
pub mod state;
