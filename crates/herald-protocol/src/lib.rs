//! # herald-protocol
//!
//! Wire protocol definitions for the Herald realtime gateway.
//!
//! This crate defines the events exchanged between chat clients and a
//! gateway process, the codecs used to put them on a WebSocket, and protocol
//! versioning.
//!
//! ## Events
//!
//! - [`ClientEvent`] - `join_channel`, `send_message`, `start_typing`, ...
//! - [`ServerEvent`] - `connected`, `new_message`, `user_joined`, `error`, ...
//! - [`OutboundEvent`] - open-named events pushed by other services
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::JoinChannel { channel_id: "7".into() };
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod version;

pub use codec::{decode, encode, Encoding, FrameCodec, ProtocolError, WireFrame};
pub use events::{
    validate_channel_id, ChannelId, ChatMessage, ClientEvent, ErrorCode, OutboundEvent,
    OutgoingMessage, ServerEvent, UserId, UserStatus,
};
pub use version::{Version, PROTOCOL_VERSION};
