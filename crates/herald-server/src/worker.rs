//! Worker side of the supervisor control channel.
//!
//! A worker started by the supervisor reads newline-delimited JSON
//! [`ControlMessage`]s from stdin and writes its own to stdout. With the
//! `memory` store backend the channel doubles as the cross-worker broadcast
//! bus: [`RelayStore`] mirrors every publish to stdout, and broadcasts relayed
//! from other workers are injected into the local store's bus.

use async_trait::async_trait;
use bytes::Bytes;
use herald_core::store::{CoordinationStore, MemoryStore, PubSubMessage, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Environment variable carrying a worker's index.
pub const WORKER_ID_ENV: &str = "HERALD_WORKER_ID";

/// A message on the supervisor control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// A store publication to replay on every other worker.
    Broadcast {
        topic: String,
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
    },
    /// Stop accepting connections and exit.
    Shutdown,
}

/// Payload bytes as a standard base64 string.
mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Control channel errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Control channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid control message: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControlMessage {
    /// Encode as one line, newline included.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_line(&self) -> Result<String, RelayError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a control message.
    pub fn from_line(line: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// This process's worker index, when it was started by the supervisor.
#[must_use]
pub fn worker_id() -> Option<usize> {
    std::env::var(WORKER_ID_ENV).ok()?.parse().ok()
}

/// A memory store whose publications are also sent to the supervisor.
pub struct RelayStore {
    inner: Arc<MemoryStore>,
    outbound: mpsc::UnboundedSender<ControlMessage>,
}

impl RelayStore {
    #[must_use]
    pub fn new(inner: Arc<MemoryStore>, outbound: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self { inner, outbound }
    }
}

#[async_trait]
impl CoordinationStore for RelayStore {
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        self.inner.incr_with_expiry(key, window).await
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.inner.hash_set(key, fields, ttl).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.inner.hash_get_all(key).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.inner.hash_delete(key, field).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.set_members(key).await
    }

    async fn set_card(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.set_card(key).await
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), StoreError> {
        self.inner.publish(topic, payload.clone()).await?;
        self.outbound
            .send(ControlMessage::Broadcast {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            })
            .map_err(|_| StoreError::Unavailable("supervisor relay closed".into()))
    }

    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<mpsc::Receiver<PubSubMessage>, StoreError> {
        self.inner.subscribe(topics).await
    }

    fn backend(&self) -> &'static str {
        "memory+relay"
    }
}

/// Read control messages until EOF or shutdown.
///
/// Relayed broadcasts are injected into `store` when one is given. A
/// `shutdown` message or the supervisor closing the pipe cancels `shutdown`.
pub async fn run_control_reader<R>(
    reader: R,
    store: Option<Arc<MemoryStore>>,
    shutdown: CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match ControlMessage::from_line(&line) {
                Ok(ControlMessage::Broadcast { topic, payload }) => match &store {
                    Some(store) => store.inject(&topic, Bytes::from(payload)),
                    None => debug!(topic = %topic, "Ignoring relayed broadcast"),
                },
                Ok(ControlMessage::Shutdown) => {
                    info!("Shutdown requested by supervisor");
                    shutdown.cancel();
                    return;
                }
                Err(e) => warn!(error = %e, "Discarding control line"),
            },
            Ok(None) => {
                info!("Control channel closed, shutting down");
                shutdown.cancel();
                return;
            }
            Err(e) => {
                warn!(error = %e, "Control channel read failed, shutting down");
                shutdown.cancel();
                return;
            }
        }
    }
}

/// Write queued control messages, one per line, until the queue closes.
///
/// # Errors
///
/// Returns an error if the writer fails.
pub async fn run_control_writer<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<ControlMessage>,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        writer.write_all(message.to_line()?.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Wire this worker to the supervisor over stdin/stdout.
///
/// Returns the queue of messages to send to the supervisor.
pub fn attach_stdio(
    memory: Option<Arc<MemoryStore>>,
    shutdown: CancellationToken,
) -> mpsc::UnboundedSender<ControlMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = run_control_writer(tokio::io::stdout(), rx).await {
            warn!(error = %e, "Control channel write failed");
        }
    });

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    tokio::spawn(run_control_reader(stdin, memory, shutdown));

    tx
}
