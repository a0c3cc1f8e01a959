//! Contracts with the services around the gateway.
//!
//! Token issuance, channel permissions, and message persistence live
//! elsewhere. The gateway talks to them through these traits; the defaults
//! here (`JwtVerifier`, `AllowAll`, `EphemeralMessageStore`) are enough for a
//! standalone deployment and for tests.

use crate::ids::{now_ms, ChannelId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use herald_protocol::ChatMessage;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Credential verification failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    Missing,

    #[error("Invalid credential: {0}")]
    Invalid(String),

    #[error("Credential verification timed out")]
    Timeout,
}

/// Failures of the channel and message services.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Turns a bearer credential into a user id.
#[async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// HS256 JWT verifier. The user id is the `sub` claim.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Verifier for tokens signed with `secret`.
    #[must_use]
    pub fn hs256(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        Ok(data.claims.sub)
    }
}

/// Channel permissions.
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync + 'static {
    /// Whether `user` is a member of `channel`.
    async fn is_member(&self, channel: &str, user: &str) -> Result<bool, CollaboratorError>;

    /// Whether `user` may read `channel`.
    async fn has_access(&self, channel: &str, user: &str) -> Result<bool, CollaboratorError>;
}

/// Grants every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl ChannelAuthorizer for AllowAll {
    async fn is_member(&self, _channel: &str, _user: &str) -> Result<bool, CollaboratorError> {
        Ok(true)
    }

    async fn has_access(&self, _channel: &str, _user: &str) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
}

/// A message to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub reply_to: Option<String>,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub reply_to: Option<String>,
    pub created_at: u64,
}

impl From<StoredMessage> for ChatMessage {
    fn from(message: StoredMessage) -> Self {
        ChatMessage {
            id: message.id,
            channel_id: message.channel_id,
            sender_id: message.sender_id,
            content: message.content,
            reply_to: message.reply_to,
            created_at: message.created_at,
            persisted: true,
        }
    }
}

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn persist(&self, message: NewMessage) -> Result<StoredMessage, CollaboratorError>;

    async fn mark_read(
        &self,
        channel: &str,
        user: &str,
        message_id: &str,
    ) -> Result<(), CollaboratorError>;
}

/// Assigns ids in memory and keeps read markers. Nothing survives a restart.
#[derive(Debug)]
pub struct EphemeralMessageStore {
    next_id: AtomicU64,
    read_markers: DashMap<(ChannelId, UserId), String>,
}

impl EphemeralMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            read_markers: DashMap::new(),
        }
    }

    /// Last message a user marked read in a channel.
    #[must_use]
    pub fn read_marker(&self, channel: &str, user: &str) -> Option<String> {
        self.read_markers
            .get(&(channel.to_string(), user.to_string()))
            .map(|m| m.clone())
    }
}

impl Default for EphemeralMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for EphemeralMessageStore {
    async fn persist(&self, message: NewMessage) -> Result<StoredMessage, CollaboratorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(StoredMessage {
            id: id.to_string(),
            channel_id: message.channel_id,
            sender_id: message.sender_id,
            content: message.content,
            reply_to: message.reply_to,
            created_at: now_ms(),
        })
    }

    async fn mark_read(
        &self,
        channel: &str,
        user: &str,
        message_id: &str,
    ) -> Result<(), CollaboratorError> {
        self.read_markers
            .insert((channel.to_string(), user.to_string()), message_id.to_string());
        Ok(())
    }
}
