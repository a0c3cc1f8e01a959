//! Shared coordination store.
//!
//! Everything that must be visible across processes (presence records,
//! channel membership sets, rate-limit counters, typing markers) and the
//! pub/sub transport between processes goes through [`CoordinationStore`].
//! The trait is deliberately narrow so a Redis deployment and the in-memory
//! backend used for single-node runs and tests are interchangeable.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffer size of a subscription's delivery queue.
pub const SUBSCRIPTION_BUFFER: usize = 4096;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete in time.
    #[error("Coordination store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something unexpected.
    #[error("Coordination store protocol error: {0}")]
    Protocol(String),
}

/// A message received from a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// The primitives the core needs from the coordination tier.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Increment a counter; the increment that creates it sets its expiry.
    ///
    /// Returns the counter value after the increment.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StoreError>;

    /// Set hash fields, refreshing the hash's expiry when `ttl` is given.
    async fn hash_set(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Get every field of a hash. Missing hashes are empty.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Delete one hash field.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StoreError>;

    /// Add a set member. Returns `true` if it was not already present.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove a set member. Returns `true` if it was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// All members of a set.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Cardinality of a set.
    async fn set_card(&self, key: &str) -> Result<u64, StoreError>;

    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), StoreError>;

    /// Subscribe to topics. Messages arrive on the returned receiver until it
    /// is dropped.
    async fn subscribe(&self, topics: &[String])
        -> Result<mpsc::Receiver<PubSubMessage>, StoreError>;

    /// Backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Run a store call with a deadline.
///
/// # Errors
///
/// Returns [`StoreError::Timeout`] if the deadline passes first, or the
/// call's own error.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Key and topic naming, with a deployment-wide prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    /// Create a key namer with the given prefix (e.g. `"herald:"`).
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Presence record of a user.
    #[must_use]
    pub fn presence(&self, user: &str) -> String {
        format!("{}presence:{}", self.prefix, user)
    }

    /// Users in a channel.
    #[must_use]
    pub fn channel_members(&self, channel: &str) -> String {
        format!("{}channel_members:{}", self.prefix, channel)
    }

    /// Channels of a user.
    #[must_use]
    pub fn user_channels(&self, user: &str) -> String {
        format!("{}user_channels:{}", self.prefix, user)
    }

    /// Typing markers of a channel.
    #[must_use]
    pub fn typing(&self, channel: &str) -> String {
        format!("{}typing:{}", self.prefix, channel)
    }

    /// Live sessions of a user across the fleet.
    #[must_use]
    pub fn user_sessions(&self, user: &str) -> String {
        format!("{}sessions:{}", self.prefix, user)
    }

    /// Live sessions of a user holding a channel across the fleet.
    #[must_use]
    pub fn channel_sessions(&self, channel: &str, user: &str) -> String {
        format!("{}channel_sessions:{}:{}", self.prefix, channel, user)
    }

    /// Rate-limit counter.
    #[must_use]
    pub fn rate_limit(&self, scope: &str, user: &str) -> String {
        format!("{}ratelimit:{}:{}", self.prefix, scope, user)
    }

    /// Topic for channel-scoped broadcasts.
    #[must_use]
    pub fn channel_topic(&self) -> String {
        format!("{}broadcast:channel", self.prefix)
    }

    /// Topic for user-scoped broadcasts.
    #[must_use]
    pub fn user_topic(&self) -> String {
        format!("{}broadcast:user", self.prefix)
    }

    /// Topic for global broadcasts.
    #[must_use]
    pub fn global_topic(&self) -> String {
        format!("{}broadcast:global", self.prefix)
    }

    /// All broadcast topics.
    #[must_use]
    pub fn broadcast_topics(&self) -> Vec<String> {
        vec![self.channel_topic(), self.user_topic(), self.global_topic()]
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("herald:")
    }
}
