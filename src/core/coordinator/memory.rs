//! In-process [`StateStore`].
//!
//! Used directly when a single worker hosts every call, and as the backing
//! store of a coordinator process that serves `POST /state` to other workers.
//! Expiry follows the tokio clock, so paused-time tests control it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::store::{SlotChange, StateStore, StateStoreError, StateStoreResult};

#[derive(Debug, Clone)]
enum Stored {
    Text(String),
    Counter(i64),
    Members(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Instant,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, Entry>,
}

impl Entries {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        let expired = self.map.get(key).is_some_and(|e| e.expires_at <= now);
        if expired {
            self.map.remove(key);
        }
        self.map.get_mut(key)
    }

    fn counter_mut(&mut self, key: &str, now: Instant, ttl: Duration) -> StateStoreResult<&mut i64> {
        if self.live(key, now).is_none() {
            self.map.insert(
                key.to_string(),
                Entry {
                    value: Stored::Counter(0),
                    expires_at: now + ttl,
                },
            );
        }
        let entry = self
            .map
            .get_mut(key)
            .ok_or_else(|| StateStoreError::Protocol(format!("missing counter {key}")))?;
        entry.expires_at = now + ttl;
        // Counters written through `set` arrive as text.
        if let Stored::Text(text) = &entry.value {
            let parsed = text
                .parse::<i64>()
                .map_err(|_| StateStoreError::WrongType(key.to_string()))?;
            entry.value = Stored::Counter(parsed);
        }
        match &mut entry.value {
            Stored::Counter(n) => Ok(n),
            _ => Err(StateStoreError::WrongType(key.to_string())),
        }
    }

    fn members_mut(
        &mut self,
        key: &str,
        now: Instant,
        ttl: Option<Duration>,
    ) -> StateStoreResult<Option<&mut HashSet<String>>> {
        if self.live(key, now).is_none() {
            let Some(ttl) = ttl else {
                return Ok(None);
            };
            self.map.insert(
                key.to_string(),
                Entry {
                    value: Stored::Members(HashSet::new()),
                    expires_at: now + ttl,
                },
            );
        }
        let Some(entry) = self.map.get_mut(key) else {
            return Ok(None);
        };
        if let Some(ttl) = ttl {
            entry.expires_at = now + ttl;
        }
        match &mut entry.value {
            Stored::Members(set) => Ok(Some(set)),
            _ => Err(StateStoreError::WrongType(key.to_string())),
        }
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<Entries>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.map.len();
        entries.map.retain(|_, e| e.expires_at > now);
        before - entries.map.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically purge expired keys so abandoned calls do not accumulate.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired state keys");
                }
            }
        })
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> StateStoreResult<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.live(key, Instant::now()) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Stored::Text(text) => Ok(Some(text.clone())),
                Stored::Counter(n) => Ok(Some(n.to_string())),
                Stored::Members(_) => Err(StateStoreError::WrongType(key.to_string())),
            },
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StateStoreResult<()> {
        self.entries.lock().map.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StateStoreResult<()> {
        self.entries.lock().map.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StateStoreResult<i64> {
        let mut entries = self.entries.lock();
        let counter = entries.counter_mut(key, Instant::now(), ttl)?;
        *counter += 1;
        Ok(*counter)
    }

    async fn decrement(&self, key: &str, ttl: Duration) -> StateStoreResult<i64> {
        let mut entries = self.entries.lock();
        let counter = entries.counter_mut(key, Instant::now(), ttl)?;
        *counter = (*counter - 1).max(0);
        Ok(*counter)
    }

    async fn add_member(&self, key: &str, member: &str, ttl: Duration) -> StateStoreResult<bool> {
        let mut entries = self.entries.lock();
        let set = entries
            .members_mut(key, Instant::now(), Some(ttl))?
            .ok_or_else(|| StateStoreError::Protocol(format!("missing set {key}")))?;
        Ok(set.insert(member.to_string()))
    }

    async fn remove_member(&self, key: &str, member: &str) -> StateStoreResult<bool> {
        let mut entries = self.entries.lock();
        Ok(entries
            .members_mut(key, Instant::now(), None)?
            .is_some_and(|set| set.remove(member)))
    }

    async fn members(&self, key: &str) -> StateStoreResult<Vec<String>> {
        let mut entries = self.entries.lock();
        let mut members: Vec<String> = entries
            .members_mut(key, Instant::now(), None)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StateStoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.live(key, now) {
            Some(entry) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn acquire_slot(
        &self,
        set_key: &str,
        counter_key: &str,
        member: &str,
        ttl: Duration,
    ) -> StateStoreResult<SlotChange> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let added = entries
            .members_mut(set_key, now, Some(ttl))?
            .ok_or_else(|| StateStoreError::Protocol(format!("missing set {set_key}")))?
            .insert(member.to_string());
        let counter = entries.counter_mut(counter_key, now, ttl)?;
        if added {
            *counter += 1;
        }
        Ok(SlotChange {
            changed: added,
            count: *counter,
        })
    }

    async fn release_slot(
        &self,
        set_key: &str,
        counter_key: &str,
        member: &str,
        ttl: Duration,
    ) -> StateStoreResult<SlotChange> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let removed = entries
            .members_mut(set_key, now, None)?
            .is_some_and(|set| set.remove(member));
        let counter = entries.counter_mut(counter_key, now, ttl)?;
        if removed {
            *counter = (*counter - 1).max(0);
        }
        Ok(SlotChange {
            changed: removed,
            count: *counter,
        })
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
