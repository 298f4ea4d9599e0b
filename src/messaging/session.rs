//! Liveness record of a consumer group.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

use super::heartbeat::{heartbeat_action, HeartbeatAction};

/// Tracks heartbeats and throughput of one consumer group.
#[derive(Debug)]
pub struct GroupSession {
    group_id: String,
    topic: String,
    last_heartbeat: RwLock<Option<DateTime<Utc>>>,
    heartbeats: AtomicU64,
    processed: AtomicU64,
}

/// Point-in-time view of a [`GroupSession`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub group_id: String,
    pub topic: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeats: u64,
    pub processed: u64,
}

impl GroupSession {
    pub fn new(group_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topic: topic.into(),
            last_heartbeat: RwLock::new(None),
            heartbeats: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Record a liveness signal.
    pub fn beat(&self) {
        *self.last_heartbeat.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        let n = self.heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(group = %self.group_id, heartbeats = n, "Heartbeat");
    }

    /// Record a fully processed message.
    pub fn mark_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Heartbeat action bound to this session.
    pub fn heartbeat_action(self: &Arc<Self>) -> HeartbeatAction {
        let session = Arc::clone(self);
        heartbeat_action(move || {
            let session = Arc::clone(&session);
            async move { session.beat() }
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            group_id: self.group_id.clone(),
            topic: self.topic.clone(),
            last_heartbeat: *self.last_heartbeat.read().unwrap_or_else(|e| e.into_inner()),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }
}
