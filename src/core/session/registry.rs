use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::call::{CallInfo, CallSession, SessionError};
use crate::core::coordinator::{SlotChange, StateCoordinator, StateStoreResult};
use crate::core::errors::report_degraded;
use crate::core::transport::PlaybackEventKind;

/// Calls hosted by this process, plus the coordinator every call shares.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<CallSession>>>>,
    coordinator: StateCoordinator,
}

impl SessionRegistry {
    pub fn new(coordinator: StateCoordinator) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &StateCoordinator {
        &self.coordinator
    }

    pub fn register(&self, session: Arc<CallSession>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session.call_id()) {
            return Err(SessionError::DuplicateCall(session.call_id().to_string()));
        }
        debug!(call_id = %session.call_id(), "Session registered");
        sessions.insert(session.call_id().to_string(), session);
        Ok(())
    }

    pub fn unregister(&self, call_id: &str) -> Option<Arc<CallSession>> {
        let removed = self.sessions.write().remove(call_id);
        if removed.is_some() {
            debug!(call_id, "Session unregistered");
        }
        removed
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.read().get(call_id).cloned()
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.sessions.read().contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Hosted calls, ordered by call id.
    pub fn list(&self) -> Vec<CallInfo> {
        let mut calls: Vec<CallInfo> = self.sessions.read().values().map(|s| s.info()).collect();
        calls.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        calls
    }

    /// Route a transport playback callback that may belong to a call hosted
    /// elsewhere. The shared state is always updated, so a call living on
    /// another worker never keeps a stuck playback slot; the local session is
    /// only told when this process hosts it.
    pub async fn playback_event(
        &self,
        call_id: &str,
        kind: PlaybackEventKind,
        unit_id: &str,
    ) -> StateStoreResult<Option<SlotChange>> {
        let change = match kind {
            PlaybackEventKind::Started => self
                .coordinator
                .playback_started(call_id, unit_id)
                .await
                .map(|_| None),
            PlaybackEventKind::Ended => self
                .coordinator
                .playback_ended(call_id, unit_id)
                .await
                .map(Some),
        };

        // A local session still hears about the event when the store is down.
        match self.get(call_id) {
            Some(session) => session.on_playback_event(kind, unit_id),
            None => {
                let missing = SessionError::NotFound(call_id.to_string());
                report_degraded(call_id, missing.kind(), &missing);
            }
        }
        change
    }

    /// Hang up every hosted call and wait for each to finish cleaning up.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<CallSession>> = self.sessions.read().values().cloned().collect();
        if sessions.is_empty() {
            return;
        }
        info!(calls = sessions.len(), "Ending hosted calls");
        for session in &sessions {
            session.hangup();
        }
        for session in sessions {
            session.closed().await;
        }
    }
}
