// Realtime presence channel
// Topic-keyed publish/subscribe contract plus an in-memory hub with soft-state expiry

use crate::error::RemoteError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

/// Liveness record published on every heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub identity_ref: String,
    pub display_name: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Realtime channel with at-most-once delivery and no durability
#[async_trait]
pub trait RealtimeChannel: Send + Sync + 'static {
    /// Resolves once the subscription is confirmed
    async fn subscribe(&self, topic: &str) -> Result<(), RemoteError>;

    async fn publish(&self, topic: &str, record: &PresenceRecord) -> Result<(), RemoteError>;

    async fn unsubscribe(&self, topic: &str, identity_ref: &str) -> Result<(), RemoteError>;
}

/// In-process presence hub, the view an external dashboard would render
pub struct InMemoryPresenceHub {
    records: DashMap<(String, String), PresenceRecord>,
    subscriptions: DashMap<String, u64>,
    expiry: chrono::Duration,
    publishes: AtomicU64,
    offline: AtomicBool,
}

impl InMemoryPresenceHub {
    pub fn new(expiry: chrono::Duration) -> Self {
        Self {
            records: DashMap::new(),
            subscriptions: DashMap::new(),
            expiry,
            publishes: AtomicU64::new(0),
            offline: AtomicBool::new(false),
        }
    }

    /// Records on `topic` still fresh right now
    pub fn online(&self, topic: &str) -> Vec<PresenceRecord> {
        self.online_at(topic, Utc::now())
    }

    /// Records on `topic` whose last heartbeat is within the expiry window at `now`
    pub fn online_at(&self, topic: &str, now: DateTime<Utc>) -> Vec<PresenceRecord> {
        let mut online: Vec<PresenceRecord> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == topic)
            .filter(|entry| now.signed_duration_since(entry.value().timestamp) <= self.expiry)
            .map(|entry| entry.value().clone())
            .collect();
        online.sort_by(|a, b| a.identity_ref.cmp(&b.identity_ref));
        online
    }

    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, topic: &str) -> u64 {
        self.subscriptions.get(topic).map(|n| *n.value()).unwrap_or(0)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn ensure_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::Relaxed) {
            Err(RemoteError::Unavailable("realtime channel is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RealtimeChannel for InMemoryPresenceHub {
    async fn subscribe(&self, topic: &str) -> Result<(), RemoteError> {
        self.ensure_online()?;
        *self.subscriptions.entry(topic.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn publish(&self, topic: &str, record: &PresenceRecord) -> Result<(), RemoteError> {
        self.ensure_online()?;
        self.records
            .insert((topic.to_string(), record.identity_ref.clone()), record.clone());
        self.publishes.fetch_add(1, Ordering::Relaxed);
        trace!(topic = topic, identity = %record.identity_ref, "Presence published");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, identity_ref: &str) -> Result<(), RemoteError> {
        self.ensure_online()?;
        self.records.remove(&(topic.to_string(), identity_ref.to_string()));
        if let Some(mut n) = self.subscriptions.get_mut(topic) {
            *n = n.saturating_sub(1);
        }
        Ok(())
    }
}
