//! Broadcast envelopes.
//!
//! An envelope is one logical event on its way to every process: what to
//! deliver, to whom, and where it came from. Envelopes are never persisted.

use crate::ids::{generate_envelope_id, now_ms, ChannelId, ProcessId, SessionId, UserId};
use herald_protocol::OutboundEvent;
use serde::{Deserialize, Serialize};

/// Unique envelope identifier.
pub type EnvelopeId = u64;

/// Audience of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Every session holding the channel.
    Channel(ChannelId),
    /// Every session of the user.
    User(UserId),
    /// Every session.
    Global,
}

impl Scope {
    /// Channel of a channel-scoped envelope.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Scope::Channel(channel) => Some(channel),
            _ => None,
        }
    }

    /// Short scope name for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Channel(_) => "channel",
            Scope::User(_) => "user",
            Scope::Global => "global",
        }
    }
}

/// A broadcast envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub scope: Scope,
    /// Wire event name delivered to clients.
    pub event: String,
    /// Event data, passed through untouched.
    pub payload: serde_json::Value,
    /// Creation time in milliseconds since the UNIX epoch.
    pub timestamp: u64,
    /// Process that published the envelope.
    pub origin: ProcessId,
    /// Session that must not receive the envelope.
    #[serde(default)]
    pub exclude: Option<SessionId>,
}

impl Envelope {
    /// Create an envelope originating from `origin`.
    #[must_use]
    pub fn new(
        scope: Scope,
        event: impl Into<String>,
        payload: serde_json::Value,
        origin: ProcessId,
    ) -> Self {
        Self {
            id: generate_envelope_id(),
            scope,
            event: event.into(),
            payload,
            timestamp: now_ms(),
            origin,
            exclude: None,
        }
    }

    /// Exclude one session from delivery.
    #[must_use]
    pub fn excluding(mut self, session: Option<SessionId>) -> Self {
        self.exclude = session;
        self
    }

    /// The client-facing event.
    #[must_use]
    pub fn to_outbound(&self) -> OutboundEvent {
        OutboundEvent::new(self.event.clone(), self.payload.clone())
    }
}
