//! Fleet-wide channel membership.
//!
//! `channel_members:{channel}` holds user ids and is mirrored by
//! `user_channels:{user}`. Both are caches of the authoritative relational
//! membership table; writes are best-effort and errors are returned to the
//! caller, which decides whether to log or surface them.

use crate::store::{with_timeout, CoordinationStore, Keys, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Channel membership sets in the coordination store.
#[derive(Clone)]
pub struct ChannelMembership {
    store: Arc<dyn CoordinationStore>,
    keys: Keys,
    timeout: Duration,
}

impl ChannelMembership {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, keys: Keys, timeout: Duration) -> Self {
        Self {
            store,
            keys,
            timeout,
        }
    }

    /// Add a user to a channel. Returns `true` if the user was not a member.
    ///
    /// # Errors
    ///
    /// Returns a store error if either set could not be updated.
    pub async fn join(&self, channel: &str, user: &str) -> Result<bool, StoreError> {
        let added = with_timeout(
            self.timeout,
            self.store.set_add(&self.keys.channel_members(channel), user),
        )
        .await?;
        with_timeout(
            self.timeout,
            self.store.set_add(&self.keys.user_channels(user), channel),
        )
        .await?;
        trace!(channel = %channel, user = %user, added, "Membership join");
        Ok(added)
    }

    /// Remove a user from a channel. Returns `true` if the user was a member.
    ///
    /// # Errors
    ///
    /// Returns a store error if either set could not be updated.
    pub async fn leave(&self, channel: &str, user: &str) -> Result<bool, StoreError> {
        let removed = with_timeout(
            self.timeout,
            self.store
                .set_remove(&self.keys.channel_members(channel), user),
        )
        .await?;
        with_timeout(
            self.timeout,
            self.store.set_remove(&self.keys.user_channels(user), channel),
        )
        .await?;
        trace!(channel = %channel, user = %user, removed, "Membership leave");
        Ok(removed)
    }

    /// Users in a channel.
    ///
    /// # Errors
    ///
    /// Returns a store error if the set could not be read.
    pub async fn members(&self, channel: &str) -> Result<Vec<String>, StoreError> {
        with_timeout(
            self.timeout,
            self.store.set_members(&self.keys.channel_members(channel)),
        )
        .await
    }

    /// Number of users in a channel across the fleet.
    ///
    /// # Errors
    ///
    /// Returns a store error if the set could not be read.
    pub async fn count(&self, channel: &str) -> Result<u64, StoreError> {
        with_timeout(
            self.timeout,
            self.store.set_card(&self.keys.channel_members(channel)),
        )
        .await
    }

    /// Channels a user is a member of.
    ///
    /// # Errors
    ///
    /// Returns a store error if the set could not be read.
    pub async fn channels_for_user(&self, user: &str) -> Result<Vec<String>, StoreError> {
        with_timeout(
            self.timeout,
            self.store.set_members(&self.keys.user_channels(user)),
        )
        .await
    }
}
