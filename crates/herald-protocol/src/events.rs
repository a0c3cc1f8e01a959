//! Event types for the Herald wire protocol.
//!
//! Every frame exchanged with a client is an event: a name plus a typed
//! payload. Inbound events are modelled by [`ClientEvent`], outbound events by
//! [`ServerEvent`]. Both serialize as `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::codec::ProtocolError;

/// A channel identifier.
pub type ChannelId = String;

/// A user identifier.
pub type UserId = String;

/// Maximum channel identifier length.
pub const MAX_CHANNEL_ID_LENGTH: usize = 128;

/// Maximum length of a custom status text.
pub const MAX_CUSTOM_STATUS_LENGTH: usize = 128;

/// Validate a channel identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_channel_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Channel id cannot be empty");
    }
    if id.len() > MAX_CHANNEL_ID_LENGTH {
        return Err("Channel id too long");
    }
    if id.starts_with('$') {
        return Err("Channel ids starting with '$' are reserved");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && c != ' ') {
        return Err("Channel id contains invalid characters");
    }
    Ok(())
}

/// User availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl UserStatus {
    /// Get the status as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Away => "away",
            UserStatus::Busy => "busy",
            UserStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserStatus {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(UserStatus::Online),
            "away" => Ok(UserStatus::Away),
            "busy" => Ok(UserStatus::Busy),
            "offline" => Ok(UserStatus::Offline),
            _ => Err("Invalid user status"),
        }
    }
}

/// A chat message submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Target channel.
    pub channel_id: ChannelId,
    /// Message text.
    pub content: String,
    /// Client-side correlation id, echoed back in `message_sent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    /// Message being replied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// A chat message as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id. Durable when `persisted` is true, temporary otherwise.
    pub id: String,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Creation time in milliseconds since the UNIX epoch.
    pub created_at: u64,
    /// Whether the message store accepted the message.
    pub persisted: bool,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Start watching a channel.
    JoinChannel { channel_id: ChannelId },

    /// Stop watching a channel.
    LeaveChannel { channel_id: ChannelId },

    /// Post a message to a joined channel.
    SendMessage(OutgoingMessage),

    /// The user started typing in a channel.
    StartTyping { channel_id: ChannelId },

    /// The user stopped typing in a channel.
    StopTyping { channel_id: ChannelId },

    /// The user read a channel up to a message.
    MarkRead {
        channel_id: ChannelId,
        message_id: String,
    },

    /// Change the user's availability status.
    UpdateStatus {
        status: UserStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_status: Option<String>,
    },

    /// Liveness ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinChannel { .. } => "join_channel",
            ClientEvent::LeaveChannel { .. } => "leave_channel",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::StartTyping { .. } => "start_typing",
            ClientEvent::StopTyping { .. } => "stop_typing",
            ClientEvent::MarkRead { .. } => "mark_read",
            ClientEvent::UpdateStatus { .. } => "update_status",
            ClientEvent::Ping { .. } => "ping",
        }
    }

    /// The channel this event targets, if any.
    #[must_use]
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            ClientEvent::JoinChannel { channel_id }
            | ClientEvent::LeaveChannel { channel_id }
            | ClientEvent::StartTyping { channel_id }
            | ClientEvent::StopTyping { channel_id }
            | ClientEvent::MarkRead { channel_id, .. } => Some(channel_id),
            ClientEvent::SendMessage(msg) => Some(&msg.channel_id),
            ClientEvent::UpdateStatus { .. } | ClientEvent::Ping { .. } => None,
        }
    }

    /// Validate the shape of the event beyond what deserialization checks.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] describing the first violation.
    pub fn validate(&self, max_message_length: usize) -> Result<(), ProtocolError> {
        if let Some(channel_id) = self.channel_id() {
            validate_channel_id(channel_id)
                .map_err(|e| ProtocolError::Invalid(e.to_string()))?;
        }

        match self {
            ClientEvent::SendMessage(msg) => {
                if msg.content.trim().is_empty() {
                    return Err(ProtocolError::Invalid("Message content is empty".into()));
                }
                let length = msg.content.chars().count();
                if length > max_message_length {
                    return Err(ProtocolError::Invalid(format!(
                        "Message content is {length} characters, maximum is {max_message_length}"
                    )));
                }
            }
            ClientEvent::MarkRead { message_id, .. } if message_id.is_empty() => {
                return Err(ProtocolError::Invalid("Message id is empty".into()));
            }
            ClientEvent::UpdateStatus {
                custom_status: Some(text),
                ..
            } if text.chars().count() > MAX_CUSTOM_STATUS_LENGTH => {
                return Err(ProtocolError::Invalid("Custom status too long".into()));
            }
            _ => {}
        }

        Ok(())
    }
}

/// Machine-readable error codes carried by [`ServerEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    Forbidden,
    RateLimited,
    Malformed,
    Unavailable,
    Internal,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake completed.
    Connected {
        session_id: String,
        user_id: UserId,
        /// Recommended ping interval in milliseconds.
        heartbeat_ms: u64,
        /// Negotiated protocol version.
        version: String,
    },

    /// Acknowledges `join_channel`.
    ChannelJoined {
        channel_id: ChannelId,
        member_count: u64,
    },

    /// Acknowledges `leave_channel`.
    ChannelLeft { channel_id: ChannelId },

    /// Acknowledges `send_message` to the sender.
    MessageSent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
        message: ChatMessage,
    },

    /// A message was posted to a joined channel.
    NewMessage(ChatMessage),

    UserJoined {
        channel_id: ChannelId,
        user_id: UserId,
    },

    UserLeft {
        channel_id: ChannelId,
        user_id: UserId,
    },

    UserTyping {
        channel_id: ChannelId,
        user_id: UserId,
    },

    UserStopTyping {
        channel_id: ChannelId,
        user_id: UserId,
    },

    MessageRead {
        channel_id: ChannelId,
        user_id: UserId,
        message_id: String,
    },

    UserStatusChanged {
        user_id: UserId,
        status: UserStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_status: Option<String>,
        last_seen: u64,
    },

    /// Reply to `ping`.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// A request failed.
    Error { code: ErrorCode, message: String },
}

impl ServerEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::ChannelJoined { .. } => "channel_joined",
            ServerEvent::ChannelLeft { .. } => "channel_left",
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::UserStopTyping { .. } => "user_stop_typing",
            ServerEvent::MessageRead { .. } => "message_read",
            ServerEvent::UserStatusChanged { .. } => "user_status_changed",
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Split this event into its name and JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn into_outbound(self) -> Result<OutboundEvent, ProtocolError> {
        let name = self.name();
        let mut value = serde_json::to_value(&self)?;
        let data = value
            .get_mut("data")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok(OutboundEvent::new(name, data))
    }
}

/// An outbound event with an open name and an opaque payload.
///
/// This is what travels through the broadcast engine: collaborators may push
/// event names the gateway itself never produces (for example
/// `reaction_toggled`). Typed [`ServerEvent`]s convert into it losslessly and
/// clients can decode it back into a [`ServerEvent`] when the name is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl OutboundEvent {
    /// Create a new outbound event.
    #[must_use]
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Try to interpret this event as a typed [`ServerEvent`].
    ///
    /// # Errors
    ///
    /// Returns an error for unknown event names or mismatched payloads.
    pub fn to_server_event(&self) -> Result<ServerEvent, ProtocolError> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }
}

impl TryFrom<ServerEvent> for OutboundEvent {
    type Error = ProtocolError;

    fn try_from(event: ServerEvent) -> Result<Self, Self::Error> {
        event.into_outbound()
    }
}
