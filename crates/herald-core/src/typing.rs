//! Typing markers.
//!
//! `typing:{channel}` is a hash of user -> expiry (ms since the UNIX epoch).
//! Markers are short-lived so late joiners can be told who is typing right
//! now; expired fields are filtered on read.

use crate::ids::now_ms;
use crate::store::{with_timeout, CoordinationStore, Keys};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default lifetime of a typing marker.
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct TypingTracker {
    store: Arc<dyn CoordinationStore>,
    keys: Keys,
    ttl: Duration,
    timeout: Duration,
}

impl TypingTracker {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: Keys,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            ttl,
            timeout,
        }
    }

    /// Write or refresh a user's marker.
    pub async fn start(&self, channel: &str, user: &str) {
        let expires = now_ms() + self.ttl.as_millis() as u64;
        let key = self.keys.typing(channel);
        let fields = [(user, expires.to_string())];
        if let Err(e) = with_timeout(
            self.timeout,
            self.store.hash_set(&key, &fields, Some(self.ttl)),
        )
        .await
        {
            warn!(channel = %channel, user = %user, error = %e, "Typing marker write failed");
        }
    }

    /// Remove a user's marker.
    pub async fn stop(&self, channel: &str, user: &str) {
        let key = self.keys.typing(channel);
        if let Err(e) = with_timeout(self.timeout, self.store.hash_delete(&key, user)).await {
            warn!(channel = %channel, user = %user, error = %e, "Typing marker delete failed");
        }
    }

    /// Users whose marker has not expired.
    pub async fn typers(&self, channel: &str) -> Vec<String> {
        let key = self.keys.typing(channel);
        let now = now_ms();
        match with_timeout(self.timeout, self.store.hash_get_all(&key)).await {
            Ok(fields) => {
                let mut users: Vec<String> = fields
                    .into_iter()
                    .filter(|(_, expiry)| expiry.parse::<u64>().map(|e| e > now).unwrap_or(false))
                    .map(|(user, _)| user)
                    .collect();
                users.sort();
                users
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Typing marker read failed");
                Vec::new()
            }
        }
    }
}
