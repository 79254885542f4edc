//! The narrow key-value contract the coordinator needs from a shared store.
//!
//! Every write carries a TTL so that state left behind by a crashed worker
//! expires on its own. Slot operations pair a member set with a counter and
//! change both in one atomic step; they are what playback leases are built on.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::errors::CallErrorKind;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateStoreError {
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("Key {0} holds a value of a different type")]
    WrongType(String),

    #[error("State store protocol error: {0}")]
    Protocol(String),
}

impl StateStoreError {
    pub fn kind(&self) -> CallErrorKind {
        CallErrorKind::StateStoreUnavailable
    }
}

pub type StateStoreResult<T> = std::result::Result<T, StateStoreError>;

/// Outcome of a slot acquire or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotChange {
    /// Whether the member set actually changed.
    pub changed: bool,
    /// Counter value after the operation.
    pub count: i64,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> StateStoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StateStoreResult<()>;

    async fn delete(&self, key: &str) -> StateStoreResult<()>;

    async fn increment(&self, key: &str, ttl: Duration) -> StateStoreResult<i64>;

    /// Decrement, saturating at zero.
    async fn decrement(&self, key: &str, ttl: Duration) -> StateStoreResult<i64>;

    /// Returns whether the member was newly added.
    async fn add_member(&self, key: &str, member: &str, ttl: Duration) -> StateStoreResult<bool>;

    /// Returns whether the member was present.
    async fn remove_member(&self, key: &str, member: &str) -> StateStoreResult<bool>;

    async fn members(&self, key: &str) -> StateStoreResult<Vec<String>>;

    /// Refresh the TTL of an existing key. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StateStoreResult<bool>;

    /// Add `member` to `set_key` and, only if it was newly added, increment
    /// `counter_key`.
    async fn acquire_slot(
        &self,
        set_key: &str,
        counter_key: &str,
        member: &str,
        ttl: Duration,
    ) -> StateStoreResult<SlotChange>;

    /// Remove `member` from `set_key` and, only if it was present, decrement
    /// `counter_key` (saturating at zero).
    async fn release_slot(
        &self,
        set_key: &str,
        counter_key: &str,
        member: &str,
        ttl: Duration,
    ) -> StateStoreResult<SlotChange>;

    fn backend_type(&self) -> &'static str;
}

/// One store operation, as carried over HTTP between workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateOp {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        ttl_ms: u64,
    },
    Delete {
        key: String,
    },
    Increment {
        key: String,
        ttl_ms: u64,
    },
    Decrement {
        key: String,
        ttl_ms: u64,
    },
    AddMember {
        key: String,
        member: String,
        ttl_ms: u64,
    },
    RemoveMember {
        key: String,
        member: String,
    },
    Members {
        key: String,
    },
    Expire {
        key: String,
        ttl_ms: u64,
    },
    AcquireSlot {
        set_key: String,
        counter_key: String,
        member: String,
        ttl_ms: u64,
    },
    ReleaseSlot {
        set_key: String,
        counter_key: String,
        member: String,
        ttl_ms: u64,
    },
}

/// Reply to a [`StateOp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateReply {
    Value { value: Option<String> },
    Count { value: i64 },
    Flag { value: bool },
    Members { members: Vec<String> },
    Slot { changed: bool, count: i64 },
    Done,
}

/// Run one wire operation against a local store.
pub async fn apply_op(store: &dyn StateStore, op: StateOp) -> StateStoreResult<StateReply> {
    let ms = Duration::from_millis;
    let reply = match op {
        StateOp::Get { key } => StateReply::Value {
            value: store.get(&key).await?,
        },
        StateOp::Set { key, value, ttl_ms } => {
            store.set(&key, &value, ms(ttl_ms)).await?;
            StateReply::Done
        }
        StateOp::Delete { key } => {
            store.delete(&key).await?;
            StateReply::Done
        }
        StateOp::Increment { key, ttl_ms } => StateReply::Count {
            value: store.increment(&key, ms(ttl_ms)).await?,
        },
        StateOp::Decrement { key, ttl_ms } => StateReply::Count {
            value: store.decrement(&key, ms(ttl_ms)).await?,
        },
        StateOp::AddMember {
            key,
            member,
            ttl_ms,
        } => StateReply::Flag {
            value: store.add_member(&key, &member, ms(ttl_ms)).await?,
        },
        StateOp::RemoveMember { key, member } => StateReply::Flag {
            value: store.remove_member(&key, &member).await?,
        },
        StateOp::Members { key } => StateReply::Members {
            members: store.members(&key).await?,
        },
        StateOp::Expire { key, ttl_ms } => StateReply::Flag {
            value: store.expire(&key, ms(ttl_ms)).await?,
        },
        StateOp::AcquireSlot {
            set_key,
            counter_key,
            member,
            ttl_ms,
        } => {
            let change = store
                .acquire_slot(&set_key, &counter_key, &member, ms(ttl_ms))
                .await?;
            StateReply::Slot {
                changed: change.changed,
                count: change.count,
            }
        }
        StateOp::ReleaseSlot {
            set_key,
            counter_key,
            member,
            ttl_ms,
        } => {
            let change = store
                .release_slot(&set_key, &counter_key, &member, ms(ttl_ms))
                .await?;
            StateReply::Slot {
                changed: change.changed,
                count: change.count,
            }
        }
    };
    Ok(reply)
}
