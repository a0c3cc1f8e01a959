//! # herald-core
//!
//! Realtime fan-out core of the Herald chat gateway.
//!
//! - **Session registry** - live connections of this process and the
//!   channels they watch
//! - **Coordination store** - presence records, membership sets, rate-limit
//!   counters, and the pub/sub transport shared by every process (Redis or
//!   in-memory)
//! - **Broadcast engine** - envelopes serialized, compressed, and batched per
//!   channel, published to the store, and re-delivered locally everywhere
//! - **Session leases** - fleet-wide record of which sessions are live and
//!   which channels they hold, deciding presence and membership changes
//! - **Gateway** - the per-process context that authenticates connections
//!   and turns client events into presence, membership, and broadcasts
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐     ┌────────────┐     ┌─────────────────┐
//! │ Connection │────▶│  Gateway   │────▶│ BroadcastEngine │
//! └────────────┘     └────────────┘     └─────────────────┘
//!                      │       │                 │  ▲
//!                      ▼       ▼                 ▼  │
//!             ┌──────────┐ ┌──────────┐   ┌────────────────────┐
//!             │ Registry │ │ Presence │──▶│ CoordinationStore  │
//!             └──────────┘ └──────────┘   └────────────────────┘
//! ```

pub mod broadcast;
pub mod collaborators;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod leases;
pub mod membership;
pub mod presence;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod typing;

pub use broadcast::{BroadcastEngine, BroadcastSettings, Envelope, Scope};
pub use collaborators::{
    AllowAll, AuthError, ChannelAuthorizer, CollaboratorError, EphemeralMessageStore,
    JwtVerifier, MessageStore, NewMessage, StoredMessage, TokenVerifier,
};
pub use error::GatewayError;
pub use gateway::{Collaborators, Gateway, GatewaySettings, RateLimit, SessionHandle};
pub use ids::{ChannelId, ProcessId, SessionId, UserId};
pub use leases::SessionLeases;
pub use presence::{PresenceRecord, PresenceTracker};
pub use session::{ClientInfo, SessionRegistry};
pub use store::{CoordinationStore, Keys, MemoryStore, StoreError};
#[cfg(feature = "redis")]
pub use store::RedisStore;
