//! In-memory coordination store.
//!
//! Implements the full [`CoordinationStore`] surface inside one process:
//! expiring counters and hashes, sets, and a topic bus. Several gateways
//! built on the same `Arc<MemoryStore>` behave like processes sharing a Redis
//! instance, which is how the cross-process tests run.

use super::{CoordinationStore, PubSubMessage, StoreError, SUBSCRIPTION_BUFFER};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Capacity of the internal topic bus.
const BUS_CAPACITY: usize = 65_536;

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// In-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    counters: DashMap<String, Expiring<u64>>,
    hashes: DashMap<String, Expiring<HashMap<String, String>>>,
    sets: DashMap<String, HashSet<String>>,
    bus: broadcast::Sender<PubSubMessage>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            counters: DashMap::new(),
            hashes: DashMap::new(),
            sets: DashMap::new(),
            bus,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }

    /// Deliver a payload to local subscribers without any availability check.
    ///
    /// Used by bridges that feed messages from another transport into this
    /// store's bus.
    pub fn inject(&self, topic: &str, payload: Bytes) {
        let _ = self.bus.send(PubSubMessage {
            topic: topic.to_string(),
            payload,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Expiring {
            value: 0,
            expires_at: Some(now + window),
        });
        if entry.is_expired(now) {
            entry.value = 0;
            entry.expires_at = Some(now + window);
        }
        entry.value += 1;
        Ok(entry.value)
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut entry = self.hashes.entry(key.to_string()).or_insert(Expiring {
            value: HashMap::new(),
            expires_at: None,
        });
        if entry.is_expired(now) {
            entry.value.clear();
            entry.expires_at = None;
        }
        for (field, value) in fields {
            entry.value.insert((*field).to_string(), value.clone());
        }
        if let Some(ttl) = ttl {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let expired = match self.hashes.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.hashes.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(HashMap::new())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.check()?;
        if let Some(mut entry) = self.hashes.get_mut(key) {
            entry.value.remove(field);
        }
        self.hashes.remove_if(key, |_, entry| entry.value.is_empty());
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check()?;
        let removed = self
            .sets
            .get_mut(key)
            .map(|mut set| set.remove(member))
            .unwrap_or(false);
        self.sets.remove_if(key, |_, set| set.is_empty());
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_card(&self, key: &str) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.sets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), StoreError> {
        self.check()?;
        self.inject(topic, payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<mpsc::Receiver<PubSubMessage>, StoreError> {
        self.check()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut bus = self.bus.subscribe();
        let topics: HashSet<String> = topics.iter().cloned().collect();

        tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(message) => {
                        if !topics.contains(&message.topic) {
                            continue;
                        }
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory store subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Memory store subscription closed");
        });

        Ok(rx)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
