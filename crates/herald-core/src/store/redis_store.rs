//! Redis coordination store.
//!
//! Commands run over one multiplexed connection. Each subscription gets its
//! own pub/sub connection, driven by a task that reconnects with exponential
//! backoff and resubscribes until the receiver is dropped.

use super::{CoordinationStore, PubSubMessage, StoreError, SUBSCRIPTION_BUFFER};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Unavailable(e.to_string())
        } else if e.is_timeout() {
            StoreError::Unavailable(format!("timeout: {e}"))
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the given Redis URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self { client, conn })
    }

    async fn open_pubsub(client: &Client, topics: &[String]) -> Result<PubSub, RedisError> {
        let mut pubsub = client.get_async_pubsub().await?;
        for topic in topics {
            pubsub.subscribe(topic).await?;
        }
        Ok(pubsub)
    }
}

/// Forward messages until the stream ends or the receiver goes away.
///
/// Returns `true` when the receiver is gone.
async fn pump(pubsub: PubSub, tx: &mpsc::Sender<PubSubMessage>) -> bool {
    let mut stream = pubsub.into_on_message();
    while let Some(msg) = stream.next().await {
        let message = PubSubMessage {
            topic: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        };
        if tx.send(message).await.is_err() {
            return true;
        }
    }
    tx.is_closed()
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let (value,): (u64,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("PX")
            .arg(window.as_millis() as u64)
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if fields.is_empty() && ttl.is_none() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !fields.is_empty() {
            pipe.hset_multiple(key, fields).ignore();
        }
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as u64)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let added: u64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn set_card(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(key).await?)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(topic, payload.as_ref()).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<mpsc::Receiver<PubSubMessage>, StoreError> {
        let topics = topics.to_vec();
        let first = Self::open_pubsub(&self.client, &topics).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut pubsub = Some(first);
            let mut delay = RECONNECT_BASE_DELAY;

            loop {
                if let Some(active) = pubsub.take() {
                    info!(topics = ?topics, "Redis subscription active");
                    delay = RECONNECT_BASE_DELAY;
                    if pump(active, &tx).await {
                        break;
                    }
                    warn!("Redis subscription stream ended, reconnecting");
                }

                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(delay).await;

                match Self::open_pubsub(&client, &topics).await {
                    Ok(fresh) => pubsub = Some(fresh),
                    Err(e) => {
                        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                        warn!(error = %e, retry_in = ?delay, "Redis resubscribe failed");
                    }
                }
            }
            debug!("Redis subscription closed");
        });

        Ok(rx)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
