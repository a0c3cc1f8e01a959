//! The gateway context.
//!
//! One [`Gateway`] is built per process and shared via `Arc` by every
//! connection task. It owns the session registry and the broadcast engine,
//! and wires inbound client events to presence, membership, typing markers,
//! and the collaborators.

use crate::broadcast::{BroadcastEngine, BroadcastSettings, Scope};
use crate::collaborators::{
    AllowAll, AuthError, ChannelAuthorizer, EphemeralMessageStore, MessageStore, NewMessage,
    TokenVerifier,
};
use crate::error::GatewayError;
use crate::ids::{generate_envelope_id, now_ms, ChannelId, ProcessId, SessionId, UserId};
use crate::leases::{SessionLeases, DEFAULT_SESSION_LEASE};
use crate::membership::ChannelMembership;
use crate::presence::{PresenceTracker, DEFAULT_PRESENCE_TTL};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::session::{
    deliver, ClientInfo, DeliveryStats, OutboundReceiver, Session, SessionRegistry,
};
use crate::store::{CoordinationStore, Keys, StoreError};
use crate::typing::{TypingTracker, DEFAULT_TYPING_TTL};
use herald_protocol::{
    ChatMessage, ClientEvent, OutgoingMessage, ProtocolError, ServerEvent, UserStatus,
    PROTOCOL_VERSION,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// A fixed-window limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub window: Duration,
    /// Maximum actions per window; 0 disables the limit.
    pub max: u64,
}

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Prefix of every store key and topic.
    pub key_prefix: String,
    /// Ping interval advertised to clients.
    pub heartbeat: Duration,
    /// Sessions idle for longer are reaped.
    pub stale_after: Duration,
    /// How often the reaper runs. Each run also renews leases and presence.
    pub reap_interval: Duration,
    /// Lifetime of an unrenewed session lease; several reap intervals.
    pub session_lease: Duration,
    /// Deadline of store and collaborator calls.
    pub store_timeout: Duration,
    /// Deadline of credential verification.
    pub auth_timeout: Duration,
    pub presence_ttl: Duration,
    pub typing_ttl: Duration,
    /// Maximum message length in characters.
    pub max_message_length: usize,
    pub max_channels_per_session: usize,
    /// Capacity of a session's outbound queue.
    pub outbound_queue: usize,
    pub connect_rate: RateLimit,
    pub event_rate: RateLimit,
    pub broadcast: BroadcastSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            key_prefix: "herald:".to_string(),
            heartbeat: Duration::from_secs(25),
            stale_after: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
            session_lease: DEFAULT_SESSION_LEASE,
            store_timeout: Duration::from_secs(2),
            auth_timeout: Duration::from_secs(5),
            presence_ttl: DEFAULT_PRESENCE_TTL,
            typing_ttl: DEFAULT_TYPING_TTL,
            max_message_length: 4000,
            max_channels_per_session: 500,
            outbound_queue: 256,
            connect_rate: RateLimit {
                window: Duration::from_secs(60),
                max: 30,
            },
            event_rate: RateLimit {
                window: Duration::from_secs(60),
                max: 600,
            },
            broadcast: BroadcastSettings::default(),
        }
    }
}

/// External services the gateway depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<dyn TokenVerifier>,
    pub authorizer: Arc<dyn ChannelAuthorizer>,
    pub messages: Arc<dyn MessageStore>,
}

impl Collaborators {
    /// Collaborators with the given verifier and the permissive defaults.
    #[must_use]
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            verifier,
            authorizer: Arc::new(AllowAll),
            messages: Arc::new(EphemeralMessageStore::new()),
        }
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn ChannelAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    #[must_use]
    pub fn with_message_store(mut self, messages: Arc<dyn MessageStore>) -> Self {
        self.messages = messages;
        self
    }
}

/// What a connection task needs to drive one session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub user_id: UserId,
    /// Events to write to the socket, starting with `connected`.
    pub outbound: OutboundReceiver,
    /// Cancelled when the server evicts the session.
    pub cancel: CancellationToken,
}

/// The gateway context.
pub struct Gateway {
    process: ProcessId,
    settings: GatewaySettings,
    store: Arc<dyn CoordinationStore>,
    registry: Arc<SessionRegistry>,
    presence: PresenceTracker,
    membership: ChannelMembership,
    leases: SessionLeases,
    typing: TypingTracker,
    connect_limiter: RateLimiter,
    event_limiter: RateLimiter,
    engine: Arc<BroadcastEngine>,
    collaborators: Collaborators,
    cancel: CancellationToken,
}

impl Gateway {
    /// Build a gateway with a fresh process id.
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        collaborators: Collaborators,
        settings: GatewaySettings,
    ) -> Self {
        Self::with_process(ProcessId::generate(), store, collaborators, settings)
    }

    /// Build a gateway with a given process id.
    #[must_use]
    pub fn with_process(
        process: ProcessId,
        store: Arc<dyn CoordinationStore>,
        collaborators: Collaborators,
        settings: GatewaySettings,
    ) -> Self {
        let keys = Keys::new(settings.key_prefix.clone());
        let timeout = settings.store_timeout;
        let registry = Arc::new(SessionRegistry::new());

        let presence = PresenceTracker::new(
            store.clone(),
            registry.clone(),
            keys.clone(),
            process.clone(),
            settings.presence_ttl,
            timeout,
        );
        let membership = ChannelMembership::new(store.clone(), keys.clone(), timeout);
        let leases =
            SessionLeases::new(store.clone(), keys.clone(), settings.session_lease, timeout);
        let typing = TypingTracker::new(store.clone(), keys.clone(), settings.typing_ttl, timeout);
        let connect_limiter = RateLimiter::new(
            store.clone(),
            keys.clone(),
            "connect",
            settings.connect_rate.window,
            settings.connect_rate.max,
            timeout,
        );
        let event_limiter = RateLimiter::new(
            store.clone(),
            keys.clone(),
            "events",
            settings.event_rate.window,
            settings.event_rate.max,
            timeout,
        );
        let engine = Arc::new(BroadcastEngine::new(
            process.clone(),
            store.clone(),
            registry.clone(),
            keys,
            settings.broadcast.clone(),
        ));

        Self {
            process,
            settings,
            store,
            registry,
            presence,
            membership,
            leases,
            typing,
            connect_limiter,
            event_limiter,
            engine,
            collaborators,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the broadcast engine and the stale-session reaper.
    ///
    /// # Errors
    ///
    /// Returns an error if the broadcast subscription cannot be established.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        self.engine.start().await?;

        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gateway.settings.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = gateway.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        gateway.renew().await;
                        let reaped = gateway.sweep_stale().await;
                        if reaped > 0 {
                            info!(reaped, "Reaped stale sessions");
                        }
                    }
                }
            }
        });

        info!(
            process = %self.process,
            backend = self.store.backend(),
            "Gateway started"
        );
        Ok(())
    }

    /// Stop background work and flush pending broadcasts.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.engine.shutdown();
    }

    #[must_use]
    pub fn process(&self) -> &ProcessId {
        &self.process
    }

    #[must_use]
    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<BroadcastEngine> {
        &self.engine
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Verify a bearer credential.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Authentication`] if the credential is absent,
    /// invalid, or not verified in time.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<UserId, GatewayError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Missing)?;
        match tokio::time::timeout(
            self.settings.auth_timeout,
            self.collaborators.verifier.verify(token),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(AuthError::Timeout.into()),
        }
    }

    /// Count a connection attempt against the user's connect limit.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RateLimited`] over the limit.
    pub async fn admit(&self, user: &str) -> Result<(), GatewayError> {
        match self.connect_limiter.check(user).await {
            RateDecision::Limited(count) => {
                warn!(user = %user, count, "Connection rate limited");
                Err(GatewayError::RateLimited)
            }
            _ => Ok(()),
        }
    }

    /// Register a new session for an authenticated user.
    ///
    /// The returned handle's queue already holds the `connected` event.
    pub async fn connect(&self, user: &str, client: ClientInfo) -> SessionHandle {
        let id = SessionId::generate(&self.process);
        let (tx, rx) = mpsc::channel(self.settings.outbound_queue.max(1));
        let session = Session::new(id.clone(), user, client, tx);
        let cancel = session.cancel_token();
        let first_local = !self.registry.user_has_sessions(user);
        self.registry.add(session);

        self.send_to(
            &id,
            ServerEvent::Connected {
                session_id: id.to_string(),
                user_id: user.to_string(),
                heartbeat_ms: self.settings.heartbeat.as_millis() as u64,
                version: PROTOCOL_VERSION.to_string(),
            },
        );

        self.presence.set_online(user, &id).await;
        let first = match self.leases.open(user, &id).await {
            Ok(others) => others == 0,
            Err(e) => {
                warn!(connection = %id, user = %user, error = %e, "Session lease failed");
                first_local
            }
        };
        if first {
            self.announce_status(user, UserStatus::Online, None, now_ms());
        }

        info!(connection = %id, user = %user, "Session connected");
        SessionHandle {
            id,
            user_id: user.to_string(),
            outbound: rx,
            cancel,
        }
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    /// Handle one inbound event.
    ///
    /// Failures are reported to the session as an `error` event and also
    /// returned. The connection stays open either way.
    ///
    /// # Errors
    ///
    /// Returns the error that was reported to the session.
    pub async fn handle(
        &self,
        session: &SessionId,
        event: ClientEvent,
    ) -> Result<(), GatewayError> {
        let result = self.checked_dispatch(session, event).await;
        if let Err(e) = &result {
            debug!(connection = %session, error = %e, "Event rejected");
            self.send_to(session, e.to_event());
        }
        result
    }

    /// Report an inbound frame that could not be decoded.
    pub fn reject_malformed(&self, session: &SessionId, error: &ProtocolError) {
        self.registry.touch(session);
        debug!(connection = %session, error = %error, "Malformed frame");
        self.send_to(session, GatewayError::Malformed(error.to_string()).to_event());
    }

    /// Record liveness for a session without an event (e.g. a transport pong).
    pub fn touch(&self, session: &SessionId) {
        self.registry.touch(session);
    }

    async fn checked_dispatch(
        &self,
        session: &SessionId,
        event: ClientEvent,
    ) -> Result<(), GatewayError> {
        let user = self
            .registry
            .user_of(session)
            .ok_or_else(|| GatewayError::Authorization("session is not connected".into()))?;
        self.registry.touch(session);

        if !matches!(event, ClientEvent::Ping { .. }) {
            if let RateDecision::Limited(count) = self.event_limiter.check(&user).await {
                warn!(connection = %session, user = %user, count, "Event rate limited");
                return Err(GatewayError::RateLimited);
            }
        }

        event.validate(self.settings.max_message_length)?;
        self.dispatch(session, &user, event).await
    }

    /// Perform a validated event for `user` on `session`.
    ///
    /// # Errors
    ///
    /// Returns an error if the user may not perform the event.
    pub async fn dispatch(
        &self,
        session: &SessionId,
        user: &str,
        event: ClientEvent,
    ) -> Result<(), GatewayError> {
        trace!(connection = %session, event = event.name(), "Dispatching");
        match event {
            ClientEvent::JoinChannel { channel_id } => {
                self.join_channel(session, user, channel_id).await
            }
            ClientEvent::LeaveChannel { channel_id } => {
                self.leave_channel(session, user, channel_id).await;
                Ok(())
            }
            ClientEvent::SendMessage(message) => self.send_message(session, user, message).await,
            ClientEvent::StartTyping { channel_id } => {
                self.require_held(session, &channel_id)?;
                self.typing.start(&channel_id, user).await;
                self.publish_event(
                    Scope::Channel(channel_id.clone()),
                    ServerEvent::UserTyping {
                        channel_id,
                        user_id: user.to_string(),
                    },
                    Some(session),
                );
                Ok(())
            }
            ClientEvent::StopTyping { channel_id } => {
                self.require_held(session, &channel_id)?;
                self.typing.stop(&channel_id, user).await;
                self.publish_event(
                    Scope::Channel(channel_id.clone()),
                    ServerEvent::UserStopTyping {
                        channel_id,
                        user_id: user.to_string(),
                    },
                    Some(session),
                );
                Ok(())
            }
            ClientEvent::MarkRead {
                channel_id,
                message_id,
            } => {
                self.require_held(session, &channel_id)?;
                self.with_deadline(self.collaborators.messages.mark_read(
                    &channel_id,
                    user,
                    &message_id,
                ))
                .await??;
                self.publish_event(
                    Scope::Channel(channel_id.clone()),
                    ServerEvent::MessageRead {
                        channel_id,
                        user_id: user.to_string(),
                        message_id,
                    },
                    Some(session),
                );
                Ok(())
            }
            ClientEvent::UpdateStatus {
                status,
                custom_status,
            } => {
                let record = self
                    .presence
                    .set_status(user, status, custom_status, session)
                    .await;
                self.announce_status(user, record.status, record.custom_status, record.last_seen);
                Ok(())
            }
            ClientEvent::Ping { timestamp } => {
                self.send_to(session, ServerEvent::Pong { timestamp });
                Ok(())
            }
        }
    }

    async fn join_channel(
        &self,
        session: &SessionId,
        user: &str,
        channel: ChannelId,
    ) -> Result<(), GatewayError> {
        let held = self.registry.holds(session, &channel);
        if !held && self.registry.channel_count(session) >= self.settings.max_channels_per_session
        {
            return Err(GatewayError::Authorization(format!(
                "channel limit of {} reached",
                self.settings.max_channels_per_session
            )));
        }

        let allowed = self
            .with_deadline(self.collaborators.authorizer.has_access(&channel, user))
            .await??;
        if !allowed {
            return Err(GatewayError::Authorization(format!(
                "no access to channel {channel}"
            )));
        }

        if self.registry.join(session, &channel).is_none() {
            return Err(GatewayError::Authorization("session is not connected".into()));
        }
        if let Err(e) = self.leases.open_channel(&channel, user, session).await {
            warn!(channel = %channel, user = %user, error = %e, "Channel lease failed");
        }
        if let Err(e) = self.membership.join(&channel, user).await {
            warn!(channel = %channel, user = %user, error = %e, "Membership join failed");
        }

        // A disconnect that ran while the store calls were in flight has
        // already released the channel; undo what was written after it.
        if !self.registry.holds(session, &channel) {
            debug!(connection = %session, channel = %channel, "Session gone during join");
            self.drop_hold(session, user, &channel).await;
            return Err(GatewayError::Authorization("session is not connected".into()));
        }

        let member_count = self.channel_users_count(&channel).await;
        self.send_to(
            session,
            ServerEvent::ChannelJoined {
                channel_id: channel.clone(),
                member_count,
            },
        );

        self.publish_event(
            Scope::Channel(channel.clone()),
            ServerEvent::UserJoined {
                channel_id: channel.clone(),
                user_id: user.to_string(),
            },
            Some(session),
        );

        for typer in self.typing.typers(&channel).await {
            if typer != user {
                self.send_to(
                    session,
                    ServerEvent::UserTyping {
                        channel_id: channel.clone(),
                        user_id: typer,
                    },
                );
            }
        }

        debug!(connection = %session, channel = %channel, "Joined channel");
        Ok(())
    }

    async fn leave_channel(&self, session: &SessionId, user: &str, channel: ChannelId) {
        let held = self.registry.leave(session, &channel) == Some(true);
        if held {
            self.release_channel(session, user, &channel).await;
        }
        self.send_to(session, ServerEvent::ChannelLeft { channel_id: channel });
    }

    /// Release a session's hold on a channel.
    ///
    /// Returns `true` if no other session anywhere in the fleet holds it, in
    /// which case the user has been removed from the membership set.
    async fn drop_hold(&self, session: &SessionId, user: &str, channel: &str) -> bool {
        let held_elsewhere = match self.leases.close_channel(channel, user, session).await {
            Ok(remaining) => remaining > 0,
            Err(e) => {
                warn!(
                    channel = %channel,
                    user = %user,
                    error = %e,
                    "Channel lease release failed"
                );
                self.registry.user_holds_elsewhere(user, channel, session)
            }
        };
        if held_elsewhere {
            return false;
        }
        if let Err(e) = self.membership.leave(channel, user).await {
            warn!(channel = %channel, user = %user, error = %e, "Membership leave failed");
        }
        true
    }

    /// Drop the user from a channel and announce it, unless another session
    /// still holds the channel.
    async fn release_channel(&self, session: &SessionId, user: &str, channel: &str) {
        if !self.drop_hold(session, user, channel).await {
            return;
        }
        self.typing.stop(channel, user).await;
        self.publish_event(
            Scope::Channel(channel.to_string()),
            ServerEvent::UserLeft {
                channel_id: channel.to_string(),
                user_id: user.to_string(),
            },
            Some(session),
        );
    }

    async fn send_message(
        &self,
        session: &SessionId,
        user: &str,
        message: OutgoingMessage,
    ) -> Result<(), GatewayError> {
        self.require_held(session, &message.channel_id)?;

        let OutgoingMessage {
            channel_id,
            content,
            client_ref,
            reply_to,
        } = message;
        let new = NewMessage {
            channel_id: channel_id.clone(),
            sender_id: user.to_string(),
            content: content.clone(),
            reply_to: reply_to.clone(),
        };

        let persisted = match self.with_deadline(self.collaborators.messages.persist(new)).await {
            Ok(Ok(stored)) => Ok(stored),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let chat = match persisted {
            Ok(stored) => ChatMessage::from(stored),
            Err(reason) => {
                let id = format!("tmp-{}", generate_envelope_id());
                warn!(
                    connection = %session,
                    channel = %channel_id,
                    temp_id = %id,
                    error = %reason,
                    "Message not persisted, broadcasting with temporary id"
                );
                ChatMessage {
                    id,
                    channel_id: channel_id.clone(),
                    sender_id: user.to_string(),
                    content,
                    reply_to,
                    created_at: now_ms(),
                    persisted: false,
                }
            }
        };

        self.typing.stop(&channel_id, user).await;
        self.send_to(
            session,
            ServerEvent::MessageSent {
                client_ref,
                message: chat.clone(),
            },
        );
        self.publish_event(Scope::Channel(channel_id), ServerEvent::NewMessage(chat), None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Disconnect and reaping
    // ------------------------------------------------------------------

    /// Tear down a session. Safe to call more than once.
    pub async fn disconnect(&self, session: &SessionId) {
        let Some(removed) = self.registry.remove(session) else {
            trace!(connection = %session, "Disconnect of unknown session ignored");
            return;
        };
        removed.cancel_token().cancel();
        let user = removed.user_id().to_string();

        for channel in removed.channels() {
            self.release_channel(session, &user, channel).await;
        }

        let last = match self.leases.close(&user, session).await {
            Ok(remaining) => remaining == 0,
            Err(e) => {
                warn!(
                    connection = %session,
                    user = %user,
                    error = %e,
                    "Session lease release failed"
                );
                !self.registry.user_has_sessions(&user)
            }
        };
        if last {
            self.presence.set_offline(&user).await;
            self.announce_status(&user, UserStatus::Offline, None, now_ms());
        }

        info!(
            connection = %session,
            user = %user,
            channels = removed.channels().len(),
            last,
            "Session disconnected"
        );
    }

    /// Renew the leases of every local session and the presence record of
    /// every local user.
    pub async fn renew(&self) {
        let mut users = HashSet::new();
        for (session, user, channels) in self.registry.snapshot() {
            if let Err(e) = self.leases.renew(&user, &session, &channels).await {
                warn!(connection = %session, error = %e, "Lease renewal failed");
            }
            if users.insert(user.clone()) {
                self.presence.refresh(&user, &session).await;
            }
        }
        trace!(users = users.len(), "Renewed leases");
    }

    /// Disconnect every session idle beyond the threshold.
    ///
    /// Returns the number of sessions reaped.
    pub async fn sweep_stale(&self) -> usize {
        let stale = self.registry.sweep_stale(self.settings.stale_after);
        for id in &stale {
            debug!(connection = %id, "Reaping stale session");
            self.disconnect(id).await;
        }
        stale.len()
    }

    // ------------------------------------------------------------------
    // Exposed broadcast surface
    // ------------------------------------------------------------------

    /// Push a named event to every session holding a channel, fleet-wide.
    pub fn broadcast_to_channel(
        &self,
        channel: &str,
        event: &str,
        payload: serde_json::Value,
        exclude: Option<SessionId>,
    ) -> DeliveryStats {
        let envelope = self
            .engine
            .envelope(Scope::Channel(channel.to_string()), event, payload)
            .excluding(exclude);
        self.engine.publish(envelope)
    }

    /// Push a named event to every session of a user, fleet-wide.
    pub fn broadcast_to_user(
        &self,
        user: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> DeliveryStats {
        let envelope = self
            .engine
            .envelope(Scope::User(user.to_string()), event, payload);
        self.engine.publish(envelope)
    }

    /// Push a named event to every session, fleet-wide.
    pub fn broadcast_global(&self, event: &str, payload: serde_json::Value) -> DeliveryStats {
        let envelope = self.engine.envelope(Scope::Global, event, payload);
        self.engine.publish(envelope)
    }

    /// Distinct users connected to this process.
    #[must_use]
    pub fn connected_users_count(&self) -> usize {
        self.registry.user_count()
    }

    /// Users in a channel across the fleet.
    ///
    /// Falls back to the local count when the store is unreachable.
    pub async fn channel_users_count(&self, channel: &str) -> u64 {
        match self.membership.count(channel).await {
            Ok(count) => count,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Membership count failed, using local count");
                self.registry.channel_user_count(channel) as u64
            }
        }
    }

    /// Local sessions holding a channel.
    #[must_use]
    pub fn local_channel_sessions(&self, channel: &str) -> usize {
        self.registry.sessions_in_channel(channel).len()
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn require_held(&self, session: &SessionId, channel: &str) -> Result<(), GatewayError> {
        if self.registry.holds(session, channel) {
            Ok(())
        } else {
            Err(GatewayError::Authorization(format!(
                "channel {channel} is not joined"
            )))
        }
    }

    async fn with_deadline<T, F>(&self, call: F) -> Result<T, GatewayError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.settings.store_timeout, call)
            .await
            .map_err(|_| GatewayError::StoreUnavailable("collaborator call timed out".into()))
    }

    fn send_to(&self, session: &SessionId, event: ServerEvent) {
        let name = event.name();
        match event.into_outbound() {
            Ok(outbound) => {
                let targets = self.registry.senders(std::slice::from_ref(session));
                deliver(targets, &Arc::new(outbound), None);
            }
            Err(e) => {
                warn!(connection = %session, event = name, error = %e, "Failed to build event");
            }
        }
    }

    fn publish_event(&self, scope: Scope, event: ServerEvent, exclude: Option<&SessionId>) {
        let name = event.name();
        match event.into_outbound() {
            Ok(outbound) => {
                let envelope = self
                    .engine
                    .envelope(scope, &outbound.event, outbound.data)
                    .excluding(exclude.cloned());
                self.engine.publish(envelope);
            }
            Err(e) => warn!(event = name, error = %e, "Failed to build event"),
        }
    }

    fn announce_status(
        &self,
        user: &str,
        status: UserStatus,
        custom_status: Option<String>,
        last_seen: u64,
    ) {
        self.publish_event(
            Scope::Global,
            ServerEvent::UserStatusChanged {
                user_id: user.to_string(),
                status,
                custom_status,
                last_seen,
            },
            None,
        );
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("process", &self.process)
            .field("backend", &self.store.backend())
            .field("sessions", &self.registry.session_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CollaboratorError, StoredMessage};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use herald_protocol::{ErrorCode, OutboundEvent};
    use serde_json::json;

    /// Accepts any token as the user id, except `"bad"`.
    struct TokenIsUser;

    #[async_trait]
    impl TokenVerifier for TokenIsUser {
        async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
            match token {
                "bad" => Err(AuthError::Invalid("rejected".into())),
                user => Ok(user.to_string()),
            }
        }
    }

    struct DenyChannel(&'static str);

    #[async_trait]
    impl ChannelAuthorizer for DenyChannel {
        async fn is_member(&self, channel: &str, _user: &str) -> Result<bool, CollaboratorError> {
            Ok(channel != self.0)
        }

        async fn has_access(&self, channel: &str, _user: &str) -> Result<bool, CollaboratorError> {
            Ok(channel != self.0)
        }
    }

    struct BrokenMessageStore;

    #[async_trait]
    impl MessageStore for BrokenMessageStore {
        async fn persist(&self, _message: NewMessage) -> Result<StoredMessage, CollaboratorError> {
            Err(CollaboratorError::Unavailable("database down".into()))
        }

        async fn mark_read(
            &self,
            _channel: &str,
            _user: &str,
            _message_id: &str,
        ) -> Result<(), CollaboratorError> {
            Err(CollaboratorError::Unavailable("database down".into()))
        }
    }

    fn unbatched() -> GatewaySettings {
        GatewaySettings {
            broadcast: BroadcastSettings {
                batching: false,
                ..BroadcastSettings::default()
            },
            ..GatewaySettings::default()
        }
    }

    fn gateway_with(
        store: Arc<MemoryStore>,
        collaborators: Collaborators,
        settings: GatewaySettings,
    ) -> Arc<Gateway> {
        Arc::new(Gateway::new(store, collaborators, settings))
    }

    fn gateway(store: Arc<MemoryStore>) -> Arc<Gateway> {
        gateway_with(store, Collaborators::new(Arc::new(TokenIsUser)), unbatched())
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<Arc<OutboundEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn named<'a>(events: &'a [Arc<OutboundEvent>], name: &str) -> Vec<&'a Arc<OutboundEvent>> {
        events.iter().filter(|e| e.event == name).collect()
    }

    async fn wait_for(rx: &mut OutboundReceiver, name: &str) -> Arc<OutboundEvent> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("outbound queue closed");
            if event.event == name {
                return event;
            }
        }
    }

    async fn join(gateway: &Gateway, session: &SessionId, channel: &str) {
        gateway
            .handle(
                session,
                ClientEvent::JoinChannel {
                    channel_id: channel.into(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_sends_connected_and_marks_online() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let user = gateway.authenticate(Some("alice")).await.unwrap();
        gateway.admit(&user).await.unwrap();
        let mut alice = gateway.connect(&user, ClientInfo::default()).await;

        let events = drain(&mut alice.outbound);
        assert_eq!(events[0].event, "connected");
        assert_eq!(events[0].data["user_id"], "alice");
        assert_eq!(events[0].data["version"], "1.0");
        assert_eq!(named(&events, "user_status_changed").len(), 1);

        assert!(gateway.presence().is_online("alice").await);
        assert_eq!(gateway.connected_users_count(), 1);
    }

    #[tokio::test]
    async fn test_authenticate_rejections() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        assert!(matches!(
            gateway.authenticate(None).await,
            Err(GatewayError::Authentication(AuthError::Missing))
        ));
        assert!(matches!(
            gateway.authenticate(Some("  ")).await,
            Err(GatewayError::Authentication(AuthError::Missing))
        ));
        assert!(matches!(
            gateway.authenticate(Some("bad")).await,
            Err(GatewayError::Authentication(AuthError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn test_connect_rate_limit() {
        let settings = GatewaySettings {
            connect_rate: RateLimit {
                window: Duration::from_secs(60),
                max: 2,
            },
            ..unbatched()
        };
        let gateway = gateway_with(
            Arc::new(MemoryStore::new()),
            Collaborators::new(Arc::new(TokenIsUser)),
            settings,
        );
        assert!(gateway.admit("alice").await.is_ok());
        assert!(gateway.admit("alice").await.is_ok());
        assert!(matches!(
            gateway.admit("alice").await,
            Err(GatewayError::RateLimited)
        ));
        assert!(gateway.admit("bob").await.is_ok());
    }

    #[tokio::test]
    async fn test_two_processes_share_channel_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let a = gateway(store.clone());
        let b = gateway(store.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();

        let mut alice = a.connect("alice", ClientInfo::default()).await;
        let mut bob = b.connect("bob", ClientInfo::default()).await;
        join(&a, &alice.id, "7").await;
        join(&b, &bob.id, "7").await;
        assert_eq!(b.channel_users_count("7").await, 2);

        a.handle(
            &alice.id,
            ClientEvent::SendMessage(OutgoingMessage {
                channel_id: "7".into(),
                content: "hello".into(),
                client_ref: Some("c-1".into()),
                reply_to: None,
            }),
        )
        .await
        .unwrap();

        let sent = wait_for(&mut alice.outbound, "message_sent").await;
        assert_eq!(sent.data["client_ref"], "c-1");
        let on_a = wait_for(&mut alice.outbound, "new_message").await;
        let on_b = wait_for(&mut bob.outbound, "new_message").await;
        assert_eq!(on_a.data, on_b.data);
        assert_eq!(on_b.data["content"], "hello");
        assert_eq!(on_b.data["persisted"], true);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(named(&drain(&mut alice.outbound), "new_message").is_empty());
        assert!(named(&drain(&mut bob.outbound), "new_message").is_empty());

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_join_leave_acks_and_announcements() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let mut alice = gateway.connect("alice", ClientInfo::default()).await;
        let mut bob = gateway.connect("bob", ClientInfo::default()).await;
        join(&gateway, &bob.id, "7").await;
        drain(&mut alice.outbound);
        drain(&mut bob.outbound);

        join(&gateway, &alice.id, "7").await;
        let alice_events = drain(&mut alice.outbound);
        let joined = named(&alice_events, "channel_joined");
        assert_eq!(joined[0].data["member_count"], 2);
        // The joiner does not see its own announcement.
        assert!(named(&alice_events, "user_joined").is_empty());
        assert_eq!(named(&drain(&mut bob.outbound), "user_joined").len(), 1);

        // Re-join is acknowledged and re-announced.
        join(&gateway, &alice.id, "7").await;
        assert_eq!(named(&drain(&mut bob.outbound), "user_joined").len(), 1);
        assert_eq!(gateway.channel_users_count("7").await, 2);

        let leave = ClientEvent::LeaveChannel {
            channel_id: "7".into(),
        };
        gateway.handle(&alice.id, leave.clone()).await.unwrap();
        assert_eq!(named(&drain(&mut alice.outbound), "channel_left").len(), 1);
        assert_eq!(named(&drain(&mut bob.outbound), "user_left").len(), 1);
        assert_eq!(gateway.channel_users_count("7").await, 1);

        // Leaving a channel not held: acked, nothing announced.
        gateway.handle(&alice.id, leave).await.unwrap();
        assert_eq!(named(&drain(&mut alice.outbound), "channel_left").len(), 1);
        assert!(drain(&mut bob.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unjoined_channel_is_forbidden() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let mut alice = gateway.connect("alice", ClientInfo::default()).await;
        drain(&mut alice.outbound);

        let result = gateway
            .handle(
                &alice.id,
                ClientEvent::SendMessage(OutgoingMessage {
                    channel_id: "7".into(),
                    content: "hi".into(),
                    client_ref: None,
                    reply_to: None,
                }),
            )
            .await;
        assert!(matches!(result, Err(GatewayError::Authorization(_))));

        let events = drain(&mut alice.outbound);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "error");
        assert_eq!(events[0].data["code"], json!(ErrorCode::Forbidden));
    }

    #[tokio::test]
    async fn test_malformed_event_rejected() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let mut alice = gateway.connect("alice", ClientInfo::default()).await;
        drain(&mut alice.outbound);

        let result = gateway
            .handle(
                &alice.id,
                ClientEvent::JoinChannel {
                    channel_id: "$system".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(GatewayError::Malformed(_))));

        gateway.reject_malformed(&alice.id, &ProtocolError::Invalid("garbage".into()));
        let events = drain(&mut alice.outbound);
        assert_eq!(named(&events, "error").len(), 2);
        assert!(events.iter().all(|e| e.data["code"] == "malformed"));
    }

    #[tokio::test]
    async fn test_authorizer_and_channel_cap() {
        let settings = GatewaySettings {
            max_channels_per_session: 2,
            ..unbatched()
        };
        let collaborators = Collaborators::new(Arc::new(TokenIsUser))
            .with_authorizer(Arc::new(DenyChannel("secret")));
        let gateway = gateway_with(Arc::new(MemoryStore::new()), collaborators, settings);
        let alice = gateway.connect("alice", ClientInfo::default()).await;

        let denied = gateway
            .handle(
                &alice.id,
                ClientEvent::JoinChannel {
                    channel_id: "secret".into(),
                },
            )
            .await;
        assert!(matches!(denied, Err(GatewayError::Authorization(_))));
        assert!(!gateway.registry().holds(&alice.id, "secret"));

        join(&gateway, &alice.id, "a").await;
        join(&gateway, &alice.id, "b").await;
        // Re-joining a held channel is fine at the cap.
        join(&gateway, &alice.id, "b").await;
        let capped = gateway
            .handle(
                &alice.id,
                ClientEvent::JoinChannel {
                    channel_id: "c".into(),
                },
            )
            .await;
        assert!(matches!(capped, Err(GatewayError::Authorization(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_rate_limit_exempts_ping() {
        let settings = GatewaySettings {
            event_rate: RateLimit {
                window: Duration::from_secs(60),
                max: 2,
            },
            ..unbatched()
        };
        let gateway = gateway_with(
            Arc::new(MemoryStore::new()),
            Collaborators::new(Arc::new(TokenIsUser)),
            settings,
        );
        let mut alice = gateway.connect("alice", ClientInfo::default()).await;

        join(&gateway, &alice.id, "a").await;
        for _ in 0..5 {
            gateway
                .handle(&alice.id, ClientEvent::Ping { timestamp: Some(1) })
                .await
                .unwrap();
        }
        join(&gateway, &alice.id, "b").await;
        let limited = gateway
            .handle(
                &alice.id,
                ClientEvent::JoinChannel {
                    channel_id: "c".into(),
                },
            )
            .await;
        assert!(matches!(limited, Err(GatewayError::RateLimited)));

        let events = drain(&mut alice.outbound);
        assert_eq!(named(&events, "pong").len(), 5);
        assert_eq!(named(&events, "pong")[0].data["timestamp"], 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        join(&gateway, &alice.id, "c").await;
    }

    #[tokio::test]
    async fn test_disconnect_last_session_goes_offline() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let alice = gateway.connect("alice", ClientInfo::default()).await;
        let mut bob = gateway.connect("bob", ClientInfo::default()).await;
        join(&gateway, &alice.id, "7").await;
        join(&gateway, &alice.id, "8").await;
        join(&gateway, &bob.id, "7").await;
        join(&gateway, &bob.id, "8").await;
        drain(&mut bob.outbound);

        gateway.disconnect(&alice.id).await;
        assert!(alice.cancel.is_cancelled());

        let events = drain(&mut bob.outbound);
        let left = named(&events, "user_left");
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|e| e.data["user_id"] == "alice"));
        let status = named(&events, "user_status_changed");
        assert_eq!(status[0].data["status"], "offline");

        let record = gateway.presence().lookup("alice").await.unwrap();
        assert_eq!(record.status, UserStatus::Offline);
        assert_eq!(gateway.channel_users_count("7").await, 1);

        // Replayed disconnect is a no-op.
        gateway.disconnect(&alice.id).await;
        assert!(drain(&mut bob.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_with_other_device_stays_online() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let phone = gateway.connect("alice", ClientInfo::default()).await;
        let laptop = gateway.connect("alice", ClientInfo::default()).await;
        let mut bob = gateway.connect("bob", ClientInfo::default()).await;
        join(&gateway, &phone.id, "7").await;
        join(&gateway, &laptop.id, "7").await;
        join(&gateway, &bob.id, "7").await;
        drain(&mut bob.outbound);

        gateway.disconnect(&phone.id).await;
        assert!(drain(&mut bob.outbound).is_empty());
        assert!(gateway.presence().is_online("alice").await);
        assert_eq!(gateway.channel_users_count("7").await, 2);
    }

    #[tokio::test]
    async fn test_disconnect_on_one_process_keeps_fleet_state() {
        let store = Arc::new(MemoryStore::new());
        let a = gateway(store.clone());
        let b = gateway(store.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();

        let on_a = a.connect("alice", ClientInfo::default()).await;
        let on_b = b.connect("alice", ClientInfo::default()).await;
        let mut bob = b.connect("bob", ClientInfo::default()).await;
        join(&a, &on_a.id, "7").await;
        join(&b, &on_b.id, "7").await;
        join(&b, &bob.id, "7").await;
        assert_eq!(b.channel_users_count("7").await, 2);

        a.disconnect(&on_a.id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = drain(&mut bob.outbound);
        assert!(named(&events, "user_left").is_empty());
        assert!(named(&events, "user_status_changed")
            .iter()
            .all(|e| e.data["status"] != "offline"));
        let record = b.presence().lookup("alice").await.unwrap();
        assert_eq!(record.status, UserStatus::Online);
        assert_eq!(b.channel_users_count("7").await, 2);

        b.disconnect(&on_b.id).await;
        let left = wait_for(&mut bob.outbound, "user_left").await;
        assert_eq!(left.data["user_id"], "alice");
        let status = wait_for(&mut bob.outbound, "user_status_changed").await;
        assert_eq!(status.data["status"], "offline");
        let record = a.presence().lookup("alice").await.unwrap();
        assert_eq!(record.status, UserStatus::Offline);
        assert_eq!(a.channel_users_count("7").await, 1);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_second_process_connect_not_announced() {
        let store = Arc::new(MemoryStore::new());
        let a = gateway(store.clone());
        let b = gateway(store.clone());
        let mut watcher = b.connect("bob", ClientInfo::default()).await;
        let _on_a = a.connect("alice", ClientInfo::default()).await;
        drain(&mut watcher.outbound);

        let _on_b = b.connect("alice", ClientInfo::default()).await;
        assert!(named(&drain(&mut watcher.outbound), "user_status_changed").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_renewed_for_long_sessions() {
        let store = Arc::new(MemoryStore::new());
        let a = gateway(store.clone());
        let b = gateway(store.clone());
        a.start().await.unwrap();
        let alice = a.connect("alice", ClientInfo::default()).await;

        // Past the presence TTL, pinging every minute.
        for _ in 0..62 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            a.handle(&alice.id, ClientEvent::Ping { timestamp: None })
                .await
                .unwrap();
        }

        assert!(a.registry().contains(&alice.id));
        let record = b.presence().lookup("alice").await.unwrap();
        assert_eq!(record.status, UserStatus::Online);
        assert!(b.presence().is_online("alice").await);
        assert_eq!(a.leases.count("alice").await.unwrap(), 1);

        a.shutdown();
    }

    /// Holds the first `set_add` after being armed until released.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        armed: std::sync::atomic::AtomicBool,
        reached: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl CoordinationStore for GatedStore {
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

        async fn hash_get_all(
            &self,
            key: &str,
        ) -> Result<std::collections::HashMap<String, String>, StoreError> {
            self.inner.hash_get_all(key).await
        }

        async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StoreError> {
            self.inner.hash_delete(key, field).await
        }

        async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
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

        async fn publish(&self, topic: &str, payload: bytes::Bytes) -> Result<(), StoreError> {
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(
            &self,
            topics: &[String],
        ) -> Result<mpsc::Receiver<crate::store::PubSubMessage>, StoreError> {
            self.inner.subscribe(topics).await
        }

        fn backend(&self) -> &'static str {
            "gated"
        }
    }

    #[tokio::test]
    async fn test_disconnect_during_join_leaves_no_member() {
        let store = Arc::new(GatedStore::default());
        let gateway = Arc::new(Gateway::new(
            store.clone(),
            Collaborators::new(Arc::new(TokenIsUser)),
            unbatched(),
        ));
        let alice = gateway.connect("alice", ClientInfo::default()).await;

        store.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        let joining = {
            let gateway = gateway.clone();
            let id = alice.id.clone();
            tokio::spawn(async move {
                gateway
                    .handle(
                        &id,
                        ClientEvent::JoinChannel {
                            channel_id: "7".into(),
                        },
                    )
                    .await
            })
        };

        store.reached.notified().await;
        gateway.disconnect(&alice.id).await;
        store.release.notify_one();

        let result = joining.await.unwrap();
        assert!(matches!(result, Err(GatewayError::Authorization(_))));
        assert_eq!(gateway.channel_users_count("7").await, 0);
        let channels = store
            .inner
            .set_members(&Keys::default().user_channels("alice"))
            .await
            .unwrap();
        assert!(channels.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_sessions_reaped() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let idle = gateway.connect("alice", ClientInfo::default()).await;
        let busy = gateway.connect("bob", ClientInfo::default()).await;
        join(&gateway, &idle.id, "7").await;
        join(&gateway, &busy.id, "7").await;
        assert_eq!(gateway.channel_users_count("7").await, 2);

        tokio::time::advance(Duration::from_secs(200)).await;
        gateway.touch(&busy.id);
        tokio::time::advance(Duration::from_secs(101)).await;

        assert_eq!(gateway.sweep_stale().await, 1);
        assert!(idle.cancel.is_cancelled());
        assert!(!busy.cancel.is_cancelled());
        assert_eq!(gateway.channel_users_count("7").await, 1);
        assert_eq!(gateway.connected_users_count(), 1);
    }

    #[tokio::test]
    async fn test_typing_replayed_to_late_joiner() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let mut alice = gateway.connect("alice", ClientInfo::default()).await;
        let mut bob = gateway.connect("bob", ClientInfo::default()).await;
        join(&gateway, &alice.id, "7").await;
        gateway
            .handle(
                &alice.id,
                ClientEvent::StartTyping {
                    channel_id: "7".into(),
                },
            )
            .await
            .unwrap();
        // The typer does not get its own echo.
        assert!(named(&drain(&mut alice.outbound), "user_typing").is_empty());

        drain(&mut bob.outbound);
        join(&gateway, &bob.id, "7").await;
        let events = drain(&mut bob.outbound);
        let typing = named(&events, "user_typing");
        assert_eq!(typing.len(), 1);
        assert_eq!(typing[0].data["user_id"], "alice");

        gateway
            .handle(
                &alice.id,
                ClientEvent::StopTyping {
                    channel_id: "7".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(named(&drain(&mut bob.outbound), "user_stop_typing").len(), 1);
    }

    #[tokio::test]
    async fn test_unpersisted_message_gets_temporary_id() {
        let collaborators = Collaborators::new(Arc::new(TokenIsUser))
            .with_message_store(Arc::new(BrokenMessageStore));
        let gateway = gateway_with(Arc::new(MemoryStore::new()), collaborators, unbatched());
        let mut alice = gateway.connect("alice", ClientInfo::default()).await;
        join(&gateway, &alice.id, "7").await;
        drain(&mut alice.outbound);

        gateway
            .handle(
                &alice.id,
                ClientEvent::SendMessage(OutgoingMessage {
                    channel_id: "7".into(),
                    content: "still delivered".into(),
                    client_ref: None,
                    reply_to: None,
                }),
            )
            .await
            .unwrap();

        let events = drain(&mut alice.outbound);
        let message = named(&events, "new_message")[0];
        assert_eq!(message.data["persisted"], false);
        assert!(message.data["id"].as_str().unwrap().starts_with("tmp-"));

        let read = gateway
            .handle(
                &alice.id,
                ClientEvent::MarkRead {
                    channel_id: "7".into(),
                    message_id: "1".into(),
                },
            )
            .await;
        assert!(matches!(read, Err(GatewayError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_update_status_broadcasts_globally() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let alice = gateway.connect("alice", ClientInfo::default()).await;
        let mut bob = gateway.connect("bob", ClientInfo::default()).await;
        drain(&mut bob.outbound);

        gateway
            .handle(
                &alice.id,
                ClientEvent::UpdateStatus {
                    status: UserStatus::Away,
                    custom_status: Some("lunch".into()),
                },
            )
            .await
            .unwrap();

        let events = drain(&mut bob.outbound);
        let changed = named(&events, "user_status_changed");
        assert_eq!(changed[0].data["status"], "away");
        assert_eq!(changed[0].data["custom_status"], "lunch");
        let record = gateway.presence().lookup("alice").await.unwrap();
        assert_eq!(record.status, UserStatus::Away);
    }

    #[tokio::test]
    async fn test_exposed_broadcasts() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let mut alice = gateway.connect("alice", ClientInfo::default()).await;
        let mut bob = gateway.connect("bob", ClientInfo::default()).await;
        join(&gateway, &alice.id, "7").await;
        drain(&mut alice.outbound);
        drain(&mut bob.outbound);

        let stats =
            gateway.broadcast_to_channel("7", "reaction_toggled", json!({"emoji": "+1"}), None);
        assert_eq!(stats.delivered, 1);
        gateway.broadcast_to_user("bob", "invitation", json!({"channel_id": "9"}));
        gateway.broadcast_global("maintenance", json!({}));

        let names = |rx: &mut OutboundReceiver| -> Vec<String> {
            drain(rx).iter().map(|e| e.event.clone()).collect()
        };
        let alice_events = names(&mut alice.outbound);
        let bob_events = names(&mut bob.outbound);
        assert_eq!(alice_events, vec!["reaction_toggled", "maintenance"]);
        assert_eq!(bob_events, vec!["invitation", "maintenance"]);
        assert_eq!(gateway.local_channel_sessions("7"), 1);
    }
}
