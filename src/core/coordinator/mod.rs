//! Cross-worker call state.
//!
//! The transport may report playback events to any worker, so "is audio
//! playing for this call" lives in a shared TTL'd store rather than in the
//! session. [`StateCoordinator`] owns the key layout; [`CallStateHandle`] is
//! the per-call view sessions and monitors use; [`PlaybackLease`] ties one
//! played unit to one slot in the shared playback count.

mod memory;
mod remote;
mod store;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

pub use memory::MemoryStateStore;
pub use remote::RemoteStateStore;
pub use store::{
    SlotChange, StateOp, StateReply, StateStore, StateStoreError, StateStoreResult, apply_op,
};

use crate::core::errors::report_degraded;

/// Key layout for one call.
#[derive(Debug, Clone)]
struct CallKeys {
    playback_set: String,
    playback_count: String,
    agent_speaking: String,
    user_speaking: String,
    webhook: String,
    silence_start: String,
    check_ins: String,
}

impl CallKeys {
    fn new(call_id: &str) -> Self {
        let key = |suffix: &str| format!("call:{call_id}:{suffix}");
        Self {
            playback_set: key("playback:active"),
            playback_count: key("playback:count"),
            agent_speaking: key("agent_speaking"),
            user_speaking: key("user_speaking"),
            webhook: key("webhook"),
            silence_start: key("silence_start_ms"),
            check_ins: key("check_ins"),
        }
    }

    fn all(&self) -> [&str; 7] {
        [
            self.playback_set.as_str(),
            self.playback_count.as_str(),
            self.agent_speaking.as_str(),
            self.user_speaking.as_str(),
            self.webhook.as_str(),
            self.silence_start.as_str(),
            self.check_ins.as_str(),
        ]
    }
}

/// Snapshot of everything shared about one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SharedCallState {
    pub call_id: String,
    pub active_playback_ids: Vec<String>,
    pub playback_count: i64,
    pub agent_speaking: bool,
    pub user_speaking: bool,
    pub webhook_executing: bool,
    pub silence_started_at_ms: Option<u64>,
    pub check_ins: u32,
}

/// The subset of shared state the dead-air monitor polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub agent_speaking: bool,
    pub user_speaking: bool,
    pub webhook_executing: bool,
    pub playback_count: i64,
}

impl Activity {
    /// Nobody is talking, nothing is playing, no webhook is running.
    pub fn is_quiet(&self) -> bool {
        !self.agent_speaking
            && !self.user_speaking
            && !self.webhook_executing
            && self.playback_count <= 0
    }
}

#[derive(Clone)]
pub struct StateCoordinator {
    store: Arc<dyn StateStore>,
    ttl: Duration,
    user_speaking_ttl: Duration,
}

impl StateCoordinator {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            user_speaking_ttl: Duration::from_secs(10),
        }
    }

    /// The user-speaking flag is refreshed by every partial transcript, so a
    /// short TTL clears it when the recognizer goes quiet without a final.
    pub fn with_user_speaking_ttl(mut self, ttl: Duration) -> Self {
        self.user_speaking_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn for_call(&self, call_id: &str) -> CallStateHandle {
        CallStateHandle {
            call_id: Arc::from(call_id),
            keys: Arc::new(CallKeys::new(call_id)),
            coordinator: self.clone(),
        }
    }

    /// A transport reported that `unit_id` finished playing, possibly to a
    /// worker that does not host the call.
    pub async fn playback_ended(&self, call_id: &str, unit_id: &str) -> StateStoreResult<SlotChange> {
        self.for_call(call_id).release_playback(unit_id).await
    }

    /// A transport reported that `unit_id` started playing.
    ///
    /// Only a unit that still holds a playback slot marks the agent as
    /// speaking; a start reported after the unit's end or its deadline
    /// release is ignored. Returns whether the flag was set.
    pub async fn playback_started(&self, call_id: &str, unit_id: &str) -> StateStoreResult<bool> {
        let handle = self.for_call(call_id);
        if !handle.is_playback_active(unit_id).await? {
            debug!(call_id, unit_id, "Ignoring start for a unit with no playback slot");
            return Ok(false);
        }
        debug!(call_id, unit_id, "Playback started");
        handle.set_agent_speaking(true).await?;
        Ok(true)
    }

    pub async fn snapshot(&self, call_id: &str) -> StateStoreResult<SharedCallState> {
        self.for_call(call_id).snapshot().await
    }
}

/// Per-call view of the shared state.
#[derive(Clone)]
pub struct CallStateHandle {
    call_id: Arc<str>,
    keys: Arc<CallKeys>,
    coordinator: StateCoordinator,
}

impl CallStateHandle {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    fn store(&self) -> &dyn StateStore {
        self.coordinator.store.as_ref()
    }

    fn ttl(&self) -> Duration {
        self.coordinator.ttl
    }

    async fn set_flag_key(&self, key: &str, on: bool, ttl: Duration) -> StateStoreResult<()> {
        if on {
            self.store().set(key, "1", ttl).await
        } else {
            self.store().delete(key).await
        }
    }

    async fn flag(&self, key: &str) -> StateStoreResult<bool> {
        Ok(self.store().get(key).await?.is_some_and(|v| v == "1"))
    }

    pub async fn set_agent_speaking(&self, speaking: bool) -> StateStoreResult<()> {
        self.set_flag_key(&self.keys.agent_speaking, speaking, self.ttl())
            .await
    }

    pub async fn set_user_speaking(&self, speaking: bool) -> StateStoreResult<()> {
        self.set_flag_key(
            &self.keys.user_speaking,
            speaking,
            self.coordinator.user_speaking_ttl,
        )
        .await
    }

    pub async fn set_webhook_executing(&self, executing: bool) -> StateStoreResult<()> {
        self.set_flag_key(&self.keys.webhook, executing, self.ttl())
            .await
    }

    /// Marks a webhook as executing until the guard is released or dropped.
    pub async fn webhook_guard(&self) -> WebhookGuard {
        if let Err(e) = self.set_webhook_executing(true).await {
            report_degraded(&self.call_id, e.kind(), &e);
        }
        WebhookGuard {
            handle: Some(self.clone()),
        }
    }

    pub async fn record_silence_start(&self, epoch_ms: u64) -> StateStoreResult<()> {
        self.store()
            .set(&self.keys.silence_start, &epoch_ms.to_string(), self.ttl())
            .await
    }

    pub async fn clear_silence_start(&self) -> StateStoreResult<()> {
        self.store().delete(&self.keys.silence_start).await
    }

    pub async fn set_check_ins(&self, count: u32) -> StateStoreResult<()> {
        self.store()
            .set(&self.keys.check_ins, &count.to_string(), self.ttl())
            .await
    }

    /// Take a slot in the shared playback count for `unit_id`.
    pub async fn acquire_playback(&self, unit_id: &str) -> StateStoreResult<PlaybackLease> {
        let change = self
            .store()
            .acquire_slot(
                &self.keys.playback_set,
                &self.keys.playback_count,
                unit_id,
                self.ttl(),
            )
            .await?;
        debug!(
            call_id = %self.call_id,
            unit_id,
            count = change.count,
            "Playback lease acquired"
        );
        Ok(PlaybackLease {
            handle: self.clone(),
            unit_id: unit_id.to_string(),
            released: false,
        })
    }

    /// Give back the slot for `unit_id`. Safe to call any number of times from
    /// any worker; only the first call changes the count.
    pub async fn release_playback(&self, unit_id: &str) -> StateStoreResult<SlotChange> {
        let change = self
            .store()
            .release_slot(
                &self.keys.playback_set,
                &self.keys.playback_count,
                unit_id,
                self.ttl(),
            )
            .await?;
        debug!(
            call_id = %self.call_id,
            unit_id,
            released = change.changed,
            count = change.count,
            "Playback slot released"
        );
        // The last slot going away also ends the speaking flag, whoever set it.
        if change.changed
            && change.count <= 0
            && let Err(e) = self.set_agent_speaking(false).await
        {
            report_degraded(&self.call_id, e.kind(), &e);
        }
        Ok(change)
    }

    /// Whether `unit_id` still holds a playback slot.
    pub async fn is_playback_active(&self, unit_id: &str) -> StateStoreResult<bool> {
        Ok(self
            .store()
            .members(&self.keys.playback_set)
            .await?
            .iter()
            .any(|m| m == unit_id))
    }

    pub async fn activity(&self) -> StateStoreResult<Activity> {
        let playback_count = self
            .store()
            .get(&self.keys.playback_count)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(Activity {
            agent_speaking: self.flag(&self.keys.agent_speaking).await?,
            user_speaking: self.flag(&self.keys.user_speaking).await?,
            webhook_executing: self.flag(&self.keys.webhook).await?,
            playback_count,
        })
    }

    pub async fn snapshot(&self) -> StateStoreResult<SharedCallState> {
        let activity = self.activity().await?;
        let silence_started_at_ms = self
            .store()
            .get(&self.keys.silence_start)
            .await?
            .and_then(|v| v.parse().ok());
        let check_ins = self
            .store()
            .get(&self.keys.check_ins)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(SharedCallState {
            call_id: self.call_id.to_string(),
            active_playback_ids: self.store().members(&self.keys.playback_set).await?,
            playback_count: activity.playback_count,
            agent_speaking: activity.agent_speaking,
            user_speaking: activity.user_speaking,
            webhook_executing: activity.webhook_executing,
            silence_started_at_ms,
            check_ins,
        })
    }

    /// Remove every key of this call.
    pub async fn clear(&self) -> StateStoreResult<()> {
        for key in self.keys.all() {
            self.store().delete(key).await?;
        }
        Ok(())
    }
}

/// One played unit's slot in the shared playback count.
///
/// Release explicitly with [`PlaybackLease::release`]; a lease dropped without
/// release (e.g. its task was cancelled) releases itself on a spawned task.
#[must_use = "a lease must be released once playback completes"]
pub struct PlaybackLease {
    handle: CallStateHandle,
    unit_id: String,
    released: bool,
}

impl PlaybackLease {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub async fn release(mut self) -> StateStoreResult<SlotChange> {
        self.released = true;
        self.handle.release_playback(&self.unit_id).await
    }
}

impl Drop for PlaybackLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let handle = self.handle.clone();
        let unit_id = std::mem::take(&mut self.unit_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = handle.release_playback(&unit_id).await {
                        report_degraded(handle.call_id(), e.kind(), &e);
                    }
                });
            }
            Err(_) => warn!(
                call_id = %self.handle.call_id,
                unit_id = %unit_id,
                "Playback lease dropped outside a runtime; slot left to expire"
            ),
        }
    }
}

/// Clears the shared webhook flag when released or dropped.
pub struct WebhookGuard {
    handle: Option<CallStateHandle>,
}

impl WebhookGuard {
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.set_webhook_executing(false).await
        {
            report_degraded(handle.call_id(), e.kind(), &e);
        }
    }
}

impl Drop for WebhookGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = handle.set_webhook_executing(false).await {
                    report_degraded(handle.call_id(), e.kind(), &e);
                }
            });
        }
    }
}
