//! Fleet-wide session leases.
//!
//! Presence and channel membership are shared by every process, so whether a
//! user is still connected, or still holds a channel, cannot be answered from
//! one process's registry. Each live session owns a field in
//! `sessions:{user}` and, per held channel, in `channel_sessions:{channel}:{user}`.
//! The field value is the lease expiry (ms since the UNIX epoch). The owning
//! process re-writes its fields on every reaper tick; fields of a process
//! that died stop being refreshed and are ignored once expired.

use crate::ids::{now_ms, SessionId};
use crate::store::{with_timeout, CoordinationStore, Keys, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Default lease length.
pub const DEFAULT_SESSION_LEASE: Duration = Duration::from_secs(180);

#[derive(Clone)]
pub struct SessionLeases {
    store: Arc<dyn CoordinationStore>,
    keys: Keys,
    lease: Duration,
    timeout: Duration,
}

impl SessionLeases {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: Keys,
        lease: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            lease,
            timeout,
        }
    }

    /// Take a user lease for a new session.
    ///
    /// Returns the number of other live sessions of the user, counted before
    /// the write so that two processes connecting at once both see zero
    /// rather than each seeing the other.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn open(&self, user: &str, session: &SessionId) -> Result<usize, StoreError> {
        let key = self.keys.user_sessions(user);
        let others = self.live(&key, Some(session)).await?;
        self.hold(&key, session).await?;
        Ok(others)
    }

    /// Drop a user lease. Returns the user's remaining live sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn close(&self, user: &str, session: &SessionId) -> Result<usize, StoreError> {
        self.release(&self.keys.user_sessions(user), session).await
    }

    /// Take or refresh a channel lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn open_channel(
        &self,
        channel: &str,
        user: &str,
        session: &SessionId,
    ) -> Result<(), StoreError> {
        self.hold(&self.keys.channel_sessions(channel, user), session)
            .await
    }

    /// Drop a channel lease. Returns the user's remaining live sessions
    /// holding the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn close_channel(
        &self,
        channel: &str,
        user: &str,
        session: &SessionId,
    ) -> Result<usize, StoreError> {
        self.release(&self.keys.channel_sessions(channel, user), session)
            .await
    }

    /// Refresh every lease of a session.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    pub async fn renew(
        &self,
        user: &str,
        session: &SessionId,
        channels: &[String],
    ) -> Result<(), StoreError> {
        self.hold(&self.keys.user_sessions(user), session).await?;
        for channel in channels {
            self.open_channel(channel, user, session).await?;
        }
        Ok(())
    }

    /// Live sessions of a user across the fleet.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn count(&self, user: &str) -> Result<usize, StoreError> {
        self.live(&self.keys.user_sessions(user), None).await
    }

    async fn hold(&self, key: &str, session: &SessionId) -> Result<(), StoreError> {
        let expires = now_ms() + self.lease.as_millis() as u64;
        let fields = [(session.as_str(), expires.to_string())];
        with_timeout(
            self.timeout,
            self.store.hash_set(key, &fields, Some(self.lease)),
        )
        .await
    }

    /// Delete first, count second: of two sessions closing at once, at least
    /// one sees the other gone.
    async fn release(&self, key: &str, session: &SessionId) -> Result<usize, StoreError> {
        with_timeout(self.timeout, self.store.hash_delete(key, session.as_str())).await?;
        self.live(key, None).await
    }

    async fn live(&self, key: &str, except: Option<&SessionId>) -> Result<usize, StoreError> {
        let now = now_ms();
        let fields = with_timeout(self.timeout, self.store.hash_get_all(key)).await?;
        Ok(fields
            .iter()
            .filter(|(session, _)| except.map(|e| e.as_str() != session.as_str()).unwrap_or(true))
            .filter(|(_, expiry)| expiry.parse::<u64>().map(|e| e > now).unwrap_or(false))
            .count())
    }
}
