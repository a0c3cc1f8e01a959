//! Envelope wire format between processes.
//!
//! A frame is a 1-byte header followed by a MessagePack body:
//!
//! ```text
//! ┌────────┬──────────────────────────────────────────┐
//! │ flags  │ body: Envelope or [Envelope] (msgpack),  │
//! │ 1 byte │ zlib-compressed when FLAG_COMPRESSED set │
//! └────────┴──────────────────────────────────────────┘
//! ```
//!
//! Bodies larger than the compression threshold are compressed, and the
//! compressed form is kept only if it is actually smaller. Envelope bodies
//! are cached in a bounded LRU keyed by content, so an identical envelope
//! sent again shortly after, alone or inside a batch, is not re-serialized.

use super::envelope::Envelope;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Body is zlib-compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;
/// Body is an array of envelopes.
pub const FLAG_BATCH: u8 = 0b0000_0010;

const KNOWN_FLAGS: u8 = FLAG_COMPRESSED | FLAG_BATCH;

/// Default size above which bodies are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Default number of cached encodings.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Upper bound on a decompressed body.
pub const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Envelope codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Empty frame")]
    Empty,

    #[error("Unknown frame flags: {0:#04x}")]
    UnknownFlags(u8),

    #[error("Decompressed body exceeds {MAX_DECOMPRESSED_SIZE} bytes")]
    TooLarge,
}

/// Identity of an envelope's content.
///
/// Two envelopes with the same event, timestamp, audience, origin and payload
/// share one encoding, whatever their ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    event: String,
    timestamp: u64,
    content: u64,
}

impl CacheKey {
    fn of(envelope: &Envelope) -> Self {
        let mut hasher = DefaultHasher::new();
        envelope.scope.hash(&mut hasher);
        envelope.origin.hash(&mut hasher);
        envelope.exclude.hash(&mut hasher);
        envelope.payload.to_string().hash(&mut hasher);
        Self {
            event: envelope.event.clone(),
            timestamp: envelope.timestamp,
            content: hasher.finish(),
        }
    }
}

/// Envelope encoder/decoder.
#[derive(Debug)]
pub struct EnvelopeCodec {
    compression_threshold: usize,
    cache: Option<Mutex<LruCache<CacheKey, Bytes>>>,
    hits: AtomicU64,
}

impl EnvelopeCodec {
    /// Create a codec. A cache capacity of 0 disables caching.
    #[must_use]
    pub fn new(compression_threshold: usize, cache_capacity: usize) -> Self {
        Self {
            compression_threshold,
            cache: NonZeroUsize::new(cache_capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            hits: AtomicU64::new(0),
        }
    }

    /// Encode one envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or compression fails.
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, CodecError> {
        let body = self.body(envelope)?;
        self.frame(0, &body)
    }

    /// Encode several envelopes into one frame.
    ///
    /// The body is a MessagePack array assembled from each envelope's
    /// (possibly cached) encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or compression fails.
    pub fn encode_batch(&self, envelopes: &[Envelope]) -> Result<Bytes, CodecError> {
        let mut body = Vec::new();
        write_array_len(&mut body, envelopes.len());
        for envelope in envelopes {
            body.extend_from_slice(&self.body(envelope)?);
        }
        self.frame(FLAG_BATCH, &body)
    }

    /// Decode a frame into its envelopes.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is empty, carries unknown flags, or the
    /// body is invalid.
    pub fn decode(&self, frame: &[u8]) -> Result<Vec<Envelope>, CodecError> {
        let (&flags, body) = frame.split_first().ok_or(CodecError::Empty)?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CodecError::UnknownFlags(flags));
        }

        let inflated;
        let body = if flags & FLAG_COMPRESSED != 0 {
            inflated = decompress(body)?;
            inflated.as_slice()
        } else {
            body
        };

        if flags & FLAG_BATCH != 0 {
            Ok(rmp_serde::from_slice(body)?)
        } else {
            Ok(vec![rmp_serde::from_slice(body)?])
        }
    }

    /// Number of cached encodings.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache
            .as_ref()
            .and_then(|c| c.lock().ok().map(|c| c.len()))
            .unwrap_or(0)
    }

    /// Encodings served from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Uncompressed MessagePack body of one envelope.
    fn body(&self, envelope: &Envelope) -> Result<Bytes, CodecError> {
        let Some(cache) = &self.cache else {
            return Ok(Bytes::from(rmp_serde::to_vec_named(envelope)?));
        };

        let key = CacheKey::of(envelope);
        if let Some(hit) = cache.lock().ok().and_then(|mut c| c.get(&key).cloned()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        let body = Bytes::from(rmp_serde::to_vec_named(envelope)?);
        if let Ok(mut cache) = cache.lock() {
            cache.put(key, body.clone());
        }
        Ok(body)
    }

    fn frame(&self, mut flags: u8, body: &[u8]) -> Result<Bytes, CodecError> {
        let compressed = if body.len() > self.compression_threshold {
            Some(compress(body)?).filter(|c| c.len() < body.len())
        } else {
            None
        };
        let body = match &compressed {
            Some(compressed) => {
                flags |= FLAG_COMPRESSED;
                compressed.as_slice()
            }
            None => body,
        };

        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(flags);
        buf.extend_from_slice(body);
        Ok(buf.freeze())
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_CACHE_CAPACITY)
    }
}

/// MessagePack array header.
fn write_array_len(buf: &mut Vec<u8>, len: usize) {
    match len {
        0..=15 => buf.push(0x90 | len as u8),
        16..=0xffff => {
            buf.push(0xdc);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            buf.push(0xdd);
            buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_DECOMPRESSED_SIZE as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > MAX_DECOMPRESSED_SIZE {
        return Err(CodecError::TooLarge);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::envelope::Scope;
    use crate::ids::ProcessId;
    use serde_json::json;

    fn envelope(content: &str) -> Envelope {
        Envelope::new(
            Scope::Channel("7".into()),
            "new_message",
            json!({"content": content, "sender_id": "alice"}),
            ProcessId::new("p1"),
        )
    }

    #[test]
    fn test_small_envelope_uncompressed() {
        let codec = EnvelopeCodec::default();
        let original = envelope("hi").excluding(Some("s1".into()));
        let frame = codec.encode(&original).unwrap();
        assert_eq!(frame[0], 0);

        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded, vec![original]);
    }

    #[test]
    fn test_large_envelope_compressed() {
        let codec = EnvelopeCodec::new(64, 0);
        let original = envelope(&"a".repeat(4096));
        let frame = codec.encode(&original).unwrap();
        assert_eq!(frame[0] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(frame.len() < 4096);

        assert_eq!(codec.decode(&frame).unwrap(), vec![original]);
    }

    #[test]
    fn test_incompressible_body_kept_raw() {
        let codec = EnvelopeCodec::new(8, 0);
        // Short bodies over the threshold where zlib overhead wins.
        let original = Envelope::new(Scope::Global, "x", json!(1), ProcessId::new("p"));
        let frame = codec.encode(&original).unwrap();
        assert_eq!(frame[0] & FLAG_COMPRESSED, 0);
        assert_eq!(codec.decode(&frame).unwrap(), vec![original]);
    }

    #[test]
    fn test_batch_frame() {
        let codec = EnvelopeCodec::default();
        let batch = vec![envelope("one"), envelope("two"), envelope("three")];
        let frame = codec.encode_batch(&batch).unwrap();
        assert_eq!(frame[0] & FLAG_BATCH, FLAG_BATCH);
        assert_eq!(codec.decode(&frame).unwrap(), batch);
    }

    #[test]
    fn test_cache_hits_on_identical_content() {
        let codec = EnvelopeCodec::new(DEFAULT_COMPRESSION_THRESHOLD, 8);
        let first = envelope("one");
        let mut resent = first.clone();
        resent.id = first.id.wrapping_add(1);
        let mut other = first.clone();
        other.payload = json!({"content": "two"});

        let a = codec.encode(&first).unwrap();
        assert_eq!(codec.encode(&resent).unwrap(), a);
        assert_ne!(codec.encode(&other).unwrap(), a);
        assert_eq!(codec.cache_hits(), 1);
        assert_eq!(codec.cached_len(), 2);
    }

    #[test]
    fn test_batch_reuses_cached_bodies() {
        let codec = EnvelopeCodec::new(DEFAULT_COMPRESSION_THRESHOLD, 64);
        let batch: Vec<_> = (0..20).map(|n| envelope(&n.to_string())).collect();
        codec.encode(&batch[3]).unwrap();

        let frame = codec.encode_batch(&batch).unwrap();
        assert_eq!(codec.cache_hits(), 1);
        // Twenty entries need the 16-bit array header.
        assert_eq!(codec.decode(&frame).unwrap(), batch);
        assert_eq!(
            frame,
            EnvelopeCodec::new(DEFAULT_COMPRESSION_THRESHOLD, 0)
                .encode_batch(&batch)
                .unwrap()
        );
    }

    #[test]
    fn test_bad_frames() {
        let codec = EnvelopeCodec::default();
        assert!(matches!(codec.decode(&[]), Err(CodecError::Empty)));
        assert!(matches!(codec.decode(&[0x80, 0]), Err(CodecError::UnknownFlags(0x80))));
        assert!(matches!(codec.decode(&[0, 0xc1]), Err(CodecError::Decode(_))));
    }
}
