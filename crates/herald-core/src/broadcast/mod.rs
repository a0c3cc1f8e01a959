//! Cross-process broadcast: envelopes, their wire codec, per-channel
//! batching, and the engine tying them to the coordination store.

pub mod batch;
pub mod codec;
pub mod engine;
pub mod envelope;

pub use batch::BatchQueues;
pub use codec::{CodecError, EnvelopeCodec};
pub use engine::{BroadcastEngine, BroadcastSettings, BroadcastStats};
pub use envelope::{Envelope, EnvelopeId, Scope};
