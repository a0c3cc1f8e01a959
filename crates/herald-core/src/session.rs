//! In-process session registry.
//!
//! Tracks every live connection of this process: who owns it, which channels
//! it watches, when it was last active, and where to push its outbound events.
//! The registry does no I/O. Maps are sharded (`dashmap`) and no shard lock
//! is ever held while touching another map in the reverse order, so
//! concurrent connection handlers never deadlock.

use crate::ids::{now_ms, ChannelId, SessionId, UserId};
use dashmap::DashMap;
use herald_protocol::{Encoding, OutboundEvent};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Sender half of a session's outbound queue.
pub type OutboundSender = mpsc::Sender<Arc<OutboundEvent>>;

/// Receiver half of a session's outbound queue.
pub type OutboundReceiver = mpsc::Receiver<Arc<OutboundEvent>>;

/// Client metadata captured at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Device class reported by the client (`web`, `ios`, ...).
    pub device: String,
    /// Transport name (`websocket`).
    pub transport: String,
    /// Negotiated wire encoding.
    pub encoding: Encoding,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            device: "unknown".to_string(),
            transport: "websocket".to_string(),
            encoding: Encoding::Json,
        }
    }
}

/// One live connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    user_id: UserId,
    channels: HashSet<ChannelId>,
    last_activity: Instant,
    connected_at: u64,
    client: ClientInfo,
    outbound: OutboundSender,
    cancel: CancellationToken,
}

impl Session {
    /// Create a new session.
    #[must_use]
    pub fn new(
        id: SessionId,
        user_id: impl Into<UserId>,
        client: ClientInfo,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            channels: HashSet::new(),
            last_activity: Instant::now(),
            connected_at: now_ms(),
            client,
            outbound,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Channels held by this session.
    #[must_use]
    pub fn channels(&self) -> &HashSet<ChannelId> {
        &self.channels
    }

    #[must_use]
    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    /// Connection time in milliseconds since the UNIX epoch.
    #[must_use]
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Time since the last inbound activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Token cancelled when the session is evicted by the server.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Outcome of pushing an event to a set of sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Events queued for a session.
    pub delivered: usize,
    /// Events dropped because a session's queue was full.
    pub dropped: usize,
}

/// The session registry.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// Sessions indexed by ID.
    sessions: DashMap<SessionId, Session>,
    /// User -> sessions of that user.
    by_user: DashMap<UserId, HashSet<SessionId>>,
    /// Channel -> sessions holding that channel.
    by_channel: DashMap<ChannelId, HashSet<SessionId>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// Returns `false` if a session with the same ID already exists.
    pub fn add(&self, session: Session) -> bool {
        let id = session.id.clone();
        let user = session.user_id.clone();

        match self.sessions.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
            }
        }
        self.by_user.entry(user.clone()).or_default().insert(id.clone());

        debug!(session = %id, user = %user, "Session registered");
        true
    }

    /// Remove a session, returning it if it was registered.
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        let (_, session) = self.sessions.remove(id)?;

        if let Some(mut sessions) = self.by_user.get_mut(&session.user_id) {
            sessions.remove(id);
        }
        self.by_user
            .remove_if(&session.user_id, |_, sessions| sessions.is_empty());

        for channel in &session.channels {
            if let Some(mut sessions) = self.by_channel.get_mut(channel) {
                sessions.remove(id);
            }
            self.by_channel
                .remove_if(channel, |_, sessions| sessions.is_empty());
        }

        debug!(session = %id, user = %session.user_id, "Session removed");
        Some(session)
    }

    /// Add a channel to a session's set.
    ///
    /// Returns `Some(true)` if newly joined, `Some(false)` if already held,
    /// and `None` if the session is unknown.
    pub fn join(&self, id: &SessionId, channel: &str) -> Option<bool> {
        let mut session = self.sessions.get_mut(id)?;
        if !session.channels.insert(channel.to_string()) {
            return Some(false);
        }
        self.by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(id.clone());
        trace!(session = %id, channel = %channel, "Session joined channel");
        Some(true)
    }

    /// Remove a channel from a session's set.
    ///
    /// Returns `Some(true)` if it was held, `Some(false)` if not, and `None`
    /// if the session is unknown.
    pub fn leave(&self, id: &SessionId, channel: &str) -> Option<bool> {
        let mut session = self.sessions.get_mut(id)?;
        if !session.channels.remove(channel) {
            return Some(false);
        }
        if let Some(mut sessions) = self.by_channel.get_mut(channel) {
            sessions.remove(id);
        }
        self.by_channel
            .remove_if(channel, |_, sessions| sessions.is_empty());
        trace!(session = %id, channel = %channel, "Session left channel");
        Some(true)
    }

    /// Check whether a session holds a channel.
    #[must_use]
    pub fn holds(&self, id: &SessionId, channel: &str) -> bool {
        self.sessions
            .get(id)
            .map(|s| s.channels.contains(channel))
            .unwrap_or(false)
    }

    /// Channels held by a session.
    #[must_use]
    pub fn channels_of(&self, id: &SessionId) -> Vec<ChannelId> {
        self.sessions
            .get(id)
            .map(|s| s.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of channels held by a session.
    #[must_use]
    pub fn channel_count(&self, id: &SessionId) -> usize {
        self.sessions.get(id).map(|s| s.channels.len()).unwrap_or(0)
    }

    /// Owner of a session.
    #[must_use]
    pub fn user_of(&self, id: &SessionId) -> Option<UserId> {
        self.sessions.get(id).map(|s| s.user_id.clone())
    }

    /// Record inbound activity on a session.
    pub fn touch(&self, id: &SessionId) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.last_activity = Instant::now();
        }
    }

    /// Check whether a session is registered.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Sessions owned by a user.
    #[must_use]
    pub fn sessions_for_user(&self, user: &str) -> Vec<SessionId> {
        self.by_user
            .get(user)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a user has any live session on this process.
    #[must_use]
    pub fn user_has_sessions(&self, user: &str) -> bool {
        self.by_user.get(user).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Local sessions holding a channel.
    #[must_use]
    pub fn sessions_in_channel(&self, channel: &str) -> Vec<SessionId> {
        self.by_channel
            .get(channel)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every live session with its owner and held channels.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(SessionId, UserId, Vec<ChannelId>)> {
        self.sessions
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    s.user_id.clone(),
                    s.channels.iter().cloned().collect(),
                )
            })
            .collect()
    }

    /// Whether any local session of `user` other than `except` holds `channel`.
    #[must_use]
    pub fn user_holds_elsewhere(&self, user: &str, channel: &str, except: &SessionId) -> bool {
        self.sessions_for_user(user)
            .iter()
            .filter(|id| *id != except)
            .any(|id| self.holds(id, channel))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of distinct users with a live session.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    /// Number of distinct local users holding a channel.
    #[must_use]
    pub fn channel_user_count(&self, channel: &str) -> usize {
        let users: HashSet<UserId> = self
            .sessions_in_channel(channel)
            .iter()
            .filter_map(|id| self.user_of(id))
            .collect();
        users.len()
    }

    /// Outbound sender of one session.
    #[must_use]
    pub fn sender(&self, id: &SessionId) -> Option<OutboundSender> {
        self.sessions.get(id).map(|s| s.outbound.clone())
    }

    /// Outbound senders of the given sessions, skipping unknown ones.
    #[must_use]
    pub fn senders(&self, ids: &[SessionId]) -> Vec<(SessionId, OutboundSender)> {
        ids.iter()
            .filter_map(|id| self.sessions.get(id).map(|s| (id.clone(), s.outbound.clone())))
            .collect()
    }

    /// Outbound senders of every local session.
    #[must_use]
    pub fn all_senders(&self) -> Vec<(SessionId, OutboundSender)> {
        self.sessions
            .iter()
            .map(|s| (s.key().clone(), s.outbound.clone()))
            .collect()
    }

    /// Cancellation token of a session.
    #[must_use]
    pub fn cancel_token(&self, id: &SessionId) -> Option<CancellationToken> {
        self.sessions.get(id).map(|s| s.cancel.clone())
    }

    /// Sessions idle for longer than `max_idle`.
    ///
    /// The registry only reports them; eviction goes through the gateway's
    /// normal disconnect path.
    #[must_use]
    pub fn sweep_stale(&self, max_idle: Duration) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|s| s.idle_for() > max_idle)
            .map(|s| s.key().clone())
            .collect()
    }
}

/// Push an event to a set of sessions without waiting.
///
/// A full queue drops the event for that session only; a closed queue means
/// the session is already going away.
pub fn deliver(
    targets: Vec<(SessionId, OutboundSender)>,
    event: &Arc<OutboundEvent>,
    exclude: Option<&SessionId>,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();

    for (id, sender) in targets {
        if exclude == Some(&id) {
            continue;
        }
        match sender.try_send(Arc::clone(event)) {
            Ok(()) => stats.delivered += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %id, event = %event.event, "Outbound queue full, dropping event");
                stats.dropped += 1;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(session = %id, "Outbound queue closed");
            }
        }
    }

    stats
}
