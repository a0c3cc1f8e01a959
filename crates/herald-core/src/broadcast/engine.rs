//! The cross-process broadcast engine.
//!
//! Publishing delivers to local sessions immediately, then hands the
//! envelope to a single publisher task (through the channel's batch queue
//! when batching is on). The publisher encodes and publishes to the store in
//! enqueue order. A receive task decodes what other processes published and
//! delivers it locally; envelopes carrying this process's id are dropped.

use super::batch::{BatchQueues, DEFAULT_BATCH_INTERVAL_MS, DEFAULT_BATCH_MAX_SIZE};
use super::codec::{EnvelopeCodec, DEFAULT_CACHE_CAPACITY, DEFAULT_COMPRESSION_THRESHOLD};
use super::envelope::{Envelope, Scope};
use crate::ids::ProcessId;
use crate::session::{deliver, DeliveryStats, SessionRegistry};
use crate::store::{with_timeout, CoordinationStore, Keys, PubSubMessage, StoreError};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Default capacity of the publisher queue.
pub const DEFAULT_PUBLISH_QUEUE: usize = 8192;

/// Broadcast engine settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Batch channel-scoped envelopes before publishing.
    pub batching: bool,
    pub batch_interval: Duration,
    pub batch_max_size: usize,
    /// Bodies above this size are compressed.
    pub compression_threshold: usize,
    /// Encoded-envelope cache capacity (0 disables).
    pub cache_capacity: usize,
    /// Deadline of one store publish.
    pub publish_timeout: Duration,
    /// Frames waiting for the publisher; further frames are dropped.
    pub publish_queue: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            batching: true,
            batch_interval: Duration::from_millis(DEFAULT_BATCH_INTERVAL_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            publish_timeout: Duration::from_secs(2),
            publish_queue: DEFAULT_PUBLISH_QUEUE,
        }
    }
}

/// Work item of the publisher task.
#[derive(Debug)]
enum Outgoing {
    Single(Envelope),
    Batch(Vec<Envelope>),
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    publish_dropped: AtomicU64,
    received: AtomicU64,
    echoes_dropped: AtomicU64,
    decode_failures: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Frames published to the store.
    pub published: u64,
    /// Frames that failed to publish.
    pub publish_failures: u64,
    /// Frames dropped because the publisher queue was full.
    pub publish_dropped: u64,
    /// Envelopes received from the store.
    pub received: u64,
    /// Received envelopes dropped because this process sent them.
    pub echoes_dropped: u64,
    /// Frames that could not be decoded.
    pub decode_failures: u64,
    /// Events queued to local sessions.
    pub delivered: u64,
    /// Events dropped on full session queues.
    pub dropped: u64,
    /// Envelopes waiting in batch queues.
    pub pending: u64,
    /// Envelope encodings served from the codec cache.
    pub cache_hits: u64,
}

/// The broadcast engine.
pub struct BroadcastEngine {
    process: ProcessId,
    store: Arc<dyn CoordinationStore>,
    registry: Arc<SessionRegistry>,
    keys: Keys,
    codec: EnvelopeCodec,
    batches: Option<BatchQueues>,
    settings: BroadcastSettings,
    publisher: mpsc::Sender<Outgoing>,
    publisher_rx: Mutex<Option<mpsc::Receiver<Outgoing>>>,
    counters: Counters,
    cancel: CancellationToken,
}

impl BroadcastEngine {
    #[must_use]
    pub fn new(
        process: ProcessId,
        store: Arc<dyn CoordinationStore>,
        registry: Arc<SessionRegistry>,
        keys: Keys,
        settings: BroadcastSettings,
    ) -> Self {
        let (publisher, publisher_rx) = mpsc::channel(settings.publish_queue.max(1));
        Self {
            process,
            store,
            registry,
            keys,
            codec: EnvelopeCodec::new(settings.compression_threshold, settings.cache_capacity),
            batches: settings
                .batching
                .then(|| BatchQueues::new(settings.batch_max_size)),
            settings,
            publisher,
            publisher_rx: Mutex::new(Some(publisher_rx)),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Process id stamped on every envelope.
    #[must_use]
    pub fn process(&self) -> &ProcessId {
        &self.process
    }

    /// Build an envelope originating from this process.
    #[must_use]
    pub fn envelope(&self, scope: Scope, event: &str, payload: serde_json::Value) -> Envelope {
        Envelope::new(scope, event, payload, self.process.clone())
    }

    /// Subscribe to the broadcast topics and start the background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        let publisher_rx = match self.publisher_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(publisher_rx) = publisher_rx else {
            warn!("Broadcast engine already started");
            return Ok(());
        };

        let incoming = self.store.subscribe(&self.keys.broadcast_topics()).await?;
        info!(
            process = %self.process,
            backend = self.store.backend(),
            batching = self.settings.batching,
            "Broadcast engine started"
        );

        tokio::spawn(Arc::clone(self).publish_loop(publisher_rx));
        tokio::spawn(Arc::clone(self).receive_loop(incoming));
        if self.batches.is_some() {
            tokio::spawn(Arc::clone(self).flush_loop());
        }
        Ok(())
    }

    /// Flush pending batches and stop the background tasks.
    pub fn shutdown(&self) {
        self.flush();
        self.cancel.cancel();
    }

    /// Publish an envelope.
    ///
    /// Local sessions receive it before this returns; other processes get it
    /// through the store. Fire-and-forget: publish failures are logged.
    pub fn publish(&self, envelope: Envelope) -> DeliveryStats {
        let local = self.deliver_local(&envelope);

        let channel = envelope.scope.channel().map(str::to_string);
        match (&self.batches, channel) {
            (Some(batches), Some(channel)) => {
                batches.push(&channel, envelope, |batch| {
                    self.enqueue(Outgoing::Batch(batch));
                });
            }
            _ => self.enqueue(Outgoing::Single(envelope)),
        }

        local
    }

    /// Deliver an envelope to the matching sessions of this process.
    pub fn deliver_local(&self, envelope: &Envelope) -> DeliveryStats {
        let targets = match &envelope.scope {
            Scope::Channel(channel) => self
                .registry
                .senders(&self.registry.sessions_in_channel(channel)),
            Scope::User(user) => self.registry.senders(&self.registry.sessions_for_user(user)),
            Scope::Global => self.registry.all_senders(),
        };
        if targets.is_empty() {
            return DeliveryStats::default();
        }

        let event = Arc::new(envelope.to_outbound());
        let stats = deliver(targets, &event, envelope.exclude.as_ref());
        self.counters
            .delivered
            .fetch_add(stats.delivered as u64, Ordering::Relaxed);
        self.counters
            .dropped
            .fetch_add(stats.dropped as u64, Ordering::Relaxed);
        trace!(
            event = %envelope.event,
            scope = envelope.scope.kind(),
            delivered = stats.delivered,
            "Delivered locally"
        );
        stats
    }

    /// Handle a frame received from the store.
    ///
    /// Returns the number of envelopes delivered locally.
    pub fn handle_incoming(&self, payload: &[u8]) -> usize {
        let envelopes = match self.codec.decode(payload) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, size = payload.len(), "Dropping undecodable broadcast frame");
                return 0;
            }
        };

        let mut handled = 0;
        for envelope in envelopes {
            self.counters.received.fetch_add(1, Ordering::Relaxed);
            if envelope.origin == self.process {
                self.counters.echoes_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.deliver_local(&envelope);
            handled += 1;
        }
        handled
    }

    /// Hand every pending batch to the publisher. Returns envelopes flushed.
    pub fn flush(&self) -> usize {
        match &self.batches {
            Some(batches) => batches.drain(|_, batch| self.enqueue(Outgoing::Batch(batch))),
            None => 0,
        }
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            publish_dropped: self.counters.publish_dropped.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            echoes_dropped: self.counters.echoes_dropped.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            pending: self
                .batches
                .as_ref()
                .map(|b| b.pending() as u64)
                .unwrap_or(0),
            cache_hits: self.codec.cache_hits(),
        }
    }

    /// Hand work to the publisher without waiting.
    ///
    /// A full queue means the store is not keeping up: the frame is dropped
    /// for other processes. Local delivery has already happened.
    fn enqueue(&self, outgoing: Outgoing) {
        match self.publisher.try_send(outgoing) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(outgoing)) => {
                let envelopes = match &outgoing {
                    Outgoing::Single(_) => 1,
                    Outgoing::Batch(batch) => batch.len(),
                };
                let dropped = self.counters.publish_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(envelopes, dropped, "Publisher queue full, broadcast dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Publisher stopped, envelope not sent to other processes");
            }
        }
    }

    fn topic_for(&self, scope: &Scope) -> String {
        match scope {
            Scope::Channel(_) => self.keys.channel_topic(),
            Scope::User(_) => self.keys.user_topic(),
            Scope::Global => self.keys.global_topic(),
        }
    }

    async fn publish_frame(&self, topic: &str, frame: Bytes) {
        match with_timeout(
            self.settings.publish_timeout,
            self.store.publish(topic, frame),
        )
        .await
        {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                error!(topic = %topic, error = %e, "Broadcast publish failed");
            }
        }
    }

    async fn send(&self, outgoing: Outgoing) {
        let (topic, encoded) = match &outgoing {
            Outgoing::Single(envelope) => (
                self.topic_for(&envelope.scope),
                self.codec.encode(envelope),
            ),
            Outgoing::Batch(batch) => match batch.first() {
                Some(first) => (
                    self.topic_for(&first.scope),
                    self.codec.encode_batch(batch),
                ),
                None => return,
            },
        };

        match encoded {
            Ok(frame) => self.publish_frame(&topic, frame).await,
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Failed to encode broadcast");
            }
        }
    }

    async fn publish_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Outgoing>) {
        loop {
            tokio::select! {
                biased;

                outgoing = rx.recv() => match outgoing {
                    Some(outgoing) => self.send(outgoing).await,
                    None => break,
                },

                _ = self.cancel.cancelled() => {
                    // Publish what was already handed over.
                    while let Ok(outgoing) = rx.try_recv() {
                        self.send(outgoing).await;
                    }
                    break;
                }
            }
        }
        debug!("Broadcast publisher stopped");
    }

    async fn receive_loop(self: Arc<Self>, mut incoming: mpsc::Receiver<PubSubMessage>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                message = incoming.recv() => match message {
                    Some(message) => {
                        trace!(
                            topic = %message.topic,
                            size = message.payload.len(),
                            "Broadcast frame received"
                        );
                        self.handle_incoming(&message.payload);
                    }
                    None => {
                        warn!("Broadcast subscription closed");
                        break;
                    }
                },
            }
        }
        debug!("Broadcast receiver stopped");
    }

    async fn flush_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.batch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush();
                }
            }
        }
    }
}

impl std::fmt::Debug for BroadcastEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEngine")
            .field("process", &self.process)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;
    use crate::session::{ClientInfo, OutboundReceiver, Session};
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Node {
        engine: Arc<BroadcastEngine>,
        registry: Arc<SessionRegistry>,
    }

    impl Node {
        async fn start(store: Arc<MemoryStore>, name: &str, settings: BroadcastSettings) -> Self {
            let registry = Arc::new(SessionRegistry::new());
            let engine = Arc::new(BroadcastEngine::new(
                ProcessId::new(name),
                store,
                registry.clone(),
                Keys::default(),
                settings,
            ));
            engine.start().await.unwrap();
            Self { engine, registry }
        }

        fn connect(&self, id: &str, user: &str, channels: &[&str]) -> OutboundReceiver {
            let (tx, rx) = mpsc::channel(64);
            self.registry
                .add(Session::new(id.into(), user, ClientInfo::default(), tx));
            for channel in channels {
                self.registry.join(&SessionId::from(id), channel);
            }
            rx
        }
    }

    fn unbatched() -> BroadcastSettings {
        BroadcastSettings {
            batching: false,
            ..BroadcastSettings::default()
        }
    }

    async fn next(rx: &mut OutboundReceiver) -> Arc<herald_protocol::OutboundEvent> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("queue closed")
    }

    #[tokio::test]
    async fn test_channel_broadcast_reaches_both_processes_once() {
        let store = Arc::new(MemoryStore::new());
        let a = Node::start(store.clone(), "proc-a", unbatched()).await;
        let b = Node::start(store.clone(), "proc-b", unbatched()).await;

        let mut on_a = a.connect("a1", "alice", &["7"]);
        let mut on_b = b.connect("b1", "bob", &["7"]);
        let mut outsider = b.connect("b2", "carol", &["8"]);

        let envelope = a.engine.envelope(
            Scope::Channel("7".into()),
            "new_message",
            json!({"content": "hello"}),
        );
        let local = a.engine.publish(envelope);
        assert_eq!(local.delivered, 1);

        let got_a = next(&mut on_a).await;
        let got_b = next(&mut on_b).await;
        assert_eq!(got_a.event, "new_message");
        assert_eq!(got_a.data, got_b.data);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(on_a.try_recv().is_err(), "echo must not be delivered twice");
        assert!(on_b.try_recv().is_err());
        assert!(outsider.try_recv().is_err());
        assert_eq!(a.engine.stats().echoes_dropped, 1);
    }

    #[tokio::test]
    async fn test_user_and_global_scopes() {
        let store = Arc::new(MemoryStore::new());
        let a = Node::start(store.clone(), "proc-a", unbatched()).await;
        let b = Node::start(store.clone(), "proc-b", unbatched()).await;

        let mut alice_a = a.connect("a1", "alice", &[]);
        let mut alice_b = b.connect("b1", "alice", &[]);
        let mut bob_b = b.connect("b2", "bob", &[]);

        a.engine.publish(a.engine.envelope(Scope::User("alice".into()), "dm", json!({})));
        assert_eq!(next(&mut alice_a).await.event, "dm");
        assert_eq!(next(&mut alice_b).await.event, "dm");

        a.engine.publish(a.engine.envelope(Scope::Global, "announce", json!({})));
        assert_eq!(next(&mut alice_a).await.event, "announce");
        assert_eq!(next(&mut alice_b).await.event, "announce");
        assert_eq!(next(&mut bob_b).await.event, "announce");
        assert!(bob_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_excluded_session_skipped_everywhere() {
        let store = Arc::new(MemoryStore::new());
        let a = Node::start(store.clone(), "proc-a", unbatched()).await;
        let b = Node::start(store.clone(), "proc-b", unbatched()).await;

        let mut sender = a.connect("a1", "alice", &["7"]);
        let mut peer = b.connect("b1", "bob", &["7"]);

        let envelope = a
            .engine
            .envelope(Scope::Channel("7".into()), "user_typing", json!({}))
            .excluding(Some("a1".into()));
        a.engine.publish(envelope);

        assert_eq!(next(&mut peer).await.event, "user_typing");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sender.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batched_order_preserved() {
        let store = Arc::new(MemoryStore::new());
        let settings = BroadcastSettings {
            batching: true,
            batch_interval: Duration::from_millis(5),
            batch_max_size: 4,
            ..BroadcastSettings::default()
        };
        let a = Node::start(store.clone(), "proc-a", settings.clone()).await;
        let b = Node::start(store.clone(), "proc-b", settings).await;
        let mut rx = b.connect("b1", "bob", &["7"]);

        for n in 0..10u64 {
            a.engine.publish(a.engine.envelope(
                Scope::Channel("7".into()),
                "new_message",
                json!({ "n": n }),
            ));
        }

        for n in 0..10u64 {
            assert_eq!(next(&mut rx).await.data["n"], json!(n));
        }
    }

    #[tokio::test]
    async fn test_publish_failure_counted() {
        let store = Arc::new(MemoryStore::new());
        let a = Node::start(store.clone(), "proc-a", unbatched()).await;
        let mut rx = a.connect("a1", "alice", &["7"]);

        store.set_available(false);
        let local = a.engine.publish(a.engine.envelope(
            Scope::Channel("7".into()),
            "new_message",
            json!({}),
        ));
        // Local delivery does not depend on the store.
        assert_eq!(local.delivered, 1);
        assert!(rx.try_recv().is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.engine.stats().publish_failures, 1);
    }

    /// A store whose publishes never complete.
    struct StalledStore(MemoryStore);

    #[async_trait::async_trait]
    impl CoordinationStore for StalledStore {
        async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
            self.0.incr_with_expiry(key, window).await
        }

        async fn hash_set(
            &self,
            key: &str,
            fields: &[(&str, String)],
            ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            self.0.hash_set(key, fields, ttl).await
        }

        async fn hash_get_all(
            &self,
            key: &str,
        ) -> Result<std::collections::HashMap<String, String>, StoreError> {
            self.0.hash_get_all(key).await
        }

        async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StoreError> {
            self.0.hash_delete(key, field).await
        }

        async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.0.set_add(key, member).await
        }

        async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.0.set_remove(key, member).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.0.set_members(key).await
        }

        async fn set_card(&self, key: &str) -> Result<u64, StoreError> {
            self.0.set_card(key).await
        }

        async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn subscribe(
            &self,
            topics: &[String],
        ) -> Result<mpsc::Receiver<PubSubMessage>, StoreError> {
            self.0.subscribe(topics).await
        }

        fn backend(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_stalled_store_bounds_publisher_queue() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = Arc::new(BroadcastEngine::new(
            ProcessId::new("proc-a"),
            Arc::new(StalledStore(MemoryStore::new())),
            registry.clone(),
            Keys::default(),
            BroadcastSettings {
                publish_queue: 2,
                publish_timeout: Duration::from_secs(3600),
                ..unbatched()
            },
        ));
        engine.start().await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        registry.add(Session::new("a1".into(), "alice", ClientInfo::default(), tx));

        let publish = |n: u64| {
            engine.publish(engine.envelope(Scope::Global, "tick", json!({ "n": n })))
        };
        // The publisher picks up the first frame and blocks on the store.
        publish(0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        for n in 1..=5 {
            assert_eq!(publish(n).delivered, 1);
        }

        let stats = engine.stats();
        assert_eq!(stats.publish_dropped, 3);
        assert_eq!(stats.published, 0);
        // Local sessions still got everything.
        for n in 0..=5u64 {
            assert_eq!(next(&mut rx).await.data["n"], json!(n));
        }
    }

    #[tokio::test]
    async fn test_repeated_content_hits_codec_cache() {
        let store = Arc::new(MemoryStore::new());
        let settings = BroadcastSettings {
            batching: true,
            batch_interval: Duration::from_millis(5),
            ..BroadcastSettings::default()
        };
        let a = Node::start(store.clone(), "proc-a", settings.clone()).await;
        let b = Node::start(store.clone(), "proc-b", settings).await;
        let mut rx = b.connect("b1", "bob", &["7"]);

        let first = a
            .engine
            .envelope(Scope::Channel("7".into()), "reaction_added", json!({"emoji": "+1"}));
        let mut again = a
            .engine
            .envelope(Scope::Channel("7".into()), "reaction_added", json!({"emoji": "+1"}));
        again.timestamp = first.timestamp;
        a.engine.publish(first);
        a.engine.publish(again);

        assert_eq!(next(&mut rx).await.event, "reaction_added");
        assert_eq!(next(&mut rx).await.event, "reaction_added");
        assert_eq!(a.engine.stats().cache_hits, 1);
    }

    #[test]
    fn test_undecodable_frame_dropped() {
        let engine = BroadcastEngine::new(
            ProcessId::new("p"),
            Arc::new(MemoryStore::new()),
            Arc::new(SessionRegistry::new()),
            Keys::default(),
            BroadcastSettings::default(),
        );
        assert_eq!(engine.handle_incoming(&[0xff]), 0);
        assert_eq!(engine.stats().decode_failures, 1);
    }
}
