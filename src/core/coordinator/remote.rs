//! [`StateStore`] client for a coordinator process serving `POST /state`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::store::{SlotChange, StateOp, StateReply, StateStore, StateStoreError, StateStoreResult};
use crate::utils::req_manager::ReqManager;

pub struct RemoteStateStore {
    endpoint: String,
    api_secret: Option<String>,
    requests: Arc<ReqManager>,
    timeout: Duration,
}

impl RemoteStateStore {
    /// `base_url` is the coordinator's root, e.g. `http://coordinator:3001`.
    pub fn new(base_url: &str, api_secret: Option<String>, requests: Arc<ReqManager>) -> Self {
        Self {
            endpoint: format!("{}/state", base_url.trim_end_matches('/')),
            api_secret,
            requests,
            timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call(&self, op: StateOp) -> StateStoreResult<StateReply> {
        let guard = self
            .requests
            .acquire()
            .await
            .map_err(|e| StateStoreError::Unavailable(e.to_string()))?;

        let mut request = guard
            .client()
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&op);
        if let Some(secret) = &self.api_secret {
            request = request.bearer_auth(secret);
        }

        let result = request.send().await;
        guard.record(&result);
        let response = result.map_err(|e| StateStoreError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(StateStoreError::Unavailable(format!(
                "coordinator answered {status}"
            )));
        }
        if status == reqwest::StatusCode::CONFLICT {
            return Err(StateStoreError::WrongType(op_key(&op).to_string()));
        }
        if !status.is_success() {
            return Err(StateStoreError::Protocol(format!(
                "coordinator answered {status}"
            )));
        }

        let reply = response
            .json::<StateReply>()
            .await
            .map_err(|e| StateStoreError::Protocol(e.to_string()))?;
        debug!(key = op_key(&op), reply = ?reply, "Remote state op");
        Ok(reply)
    }
}

fn op_key(op: &StateOp) -> &str {
    match op {
        StateOp::Get { key }
        | StateOp::Set { key, .. }
        | StateOp::Delete { key }
        | StateOp::Increment { key, .. }
        | StateOp::Decrement { key, .. }
        | StateOp::AddMember { key, .. }
        | StateOp::RemoveMember { key, .. }
        | StateOp::Members { key }
        | StateOp::Expire { key, .. } => key,
        StateOp::AcquireSlot { set_key, .. } | StateOp::ReleaseSlot { set_key, .. } => set_key,
    }
}

fn unexpected(reply: StateReply) -> StateStoreError {
    StateStoreError::Protocol(format!("unexpected reply {reply:?}"))
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl StateStore for RemoteStateStore {
    async fn get(&self, key: &str) -> StateStoreResult<Option<String>> {
        match self.call(StateOp::Get { key: key.into() }).await? {
            StateReply::Value { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StateStoreResult<()> {
        let op = StateOp::Set {
            key: key.into(),
            value: value.into(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(op).await? {
            StateReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, key: &str) -> StateStoreResult<()> {
        match self.call(StateOp::Delete { key: key.into() }).await? {
            StateReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StateStoreResult<i64> {
        let op = StateOp::Increment {
            key: key.into(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(op).await? {
            StateReply::Count { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn decrement(&self, key: &str, ttl: Duration) -> StateStoreResult<i64> {
        let op = StateOp::Decrement {
            key: key.into(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(op).await? {
            StateReply::Count { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn add_member(&self, key: &str, member: &str, ttl: Duration) -> StateStoreResult<bool> {
        let op = StateOp::AddMember {
            key: key.into(),
            member: member.into(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(op).await? {
            StateReply::Flag { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn remove_member(&self, key: &str, member: &str) -> StateStoreResult<bool> {
        let op = StateOp::RemoveMember {
            key: key.into(),
            member: member.into(),
        };
        match self.call(op).await? {
            StateReply::Flag { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn members(&self, key: &str) -> StateStoreResult<Vec<String>> {
        match self.call(StateOp::Members { key: key.into() }).await? {
            StateReply::Members { members } => Ok(members),
            other => Err(unexpected(other)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StateStoreResult<bool> {
        let op = StateOp::Expire {
            key: key.into(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(op).await? {
            StateReply::Flag { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn acquire_slot(
        &self,
        set_key: &str,
        counter_key: &str,
        member: &str,
        ttl: Duration,
    ) -> StateStoreResult<SlotChange> {
        let op = StateOp::AcquireSlot {
            set_key: set_key.into(),
            counter_key: counter_key.into(),
            member: member.into(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(op).await? {
            StateReply::Slot { changed, count } => Ok(SlotChange { changed, count }),
            other => Err(unexpected(other)),
        }
    }

    async fn release_slot(
        &self,
        set_key: &str,
        counter_key: &str,
        member: &str,
        ttl: Duration,
    ) -> StateStoreResult<SlotChange> {
        let op = StateOp::ReleaseSlot {
            set_key: set_key.into(),
            counter_key: counter_key.into(),
            member: member.into(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(op).await? {
            StateReply::Slot { changed, count } => Ok(SlotChange { changed, count }),
            other => Err(unexpected(other)),
        }
    }

    fn backend_type(&self) -> &'static str {
        "remote"
    }
}
