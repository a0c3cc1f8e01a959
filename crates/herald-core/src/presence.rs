//! Presence tracking.
//!
//! Each user has one record in the store (`presence:{user}`, a hash with a
//! TTL) reflecting the most recent status-setting session anywhere in the
//! fleet. Local sessions come from the [`SessionRegistry`]. Every store call
//! here is best-effort: failures are logged and swallowed.

use crate::ids::{now_ms, ProcessId, SessionId};
use crate::session::SessionRegistry;
use crate::store::{with_timeout, CoordinationStore, Keys};
use herald_protocol::UserStatus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default TTL of a presence record.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(3600);

const FIELD_STATUS: &str = "status";
const FIELD_CUSTOM_STATUS: &str = "custom_status";
const FIELD_LAST_SEEN: &str = "last_seen";
const FIELD_PROCESS: &str = "process";
const FIELD_SESSION: &str = "session";

/// A user's presence record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub status: UserStatus,
    pub custom_status: Option<String>,
    /// Milliseconds since the UNIX epoch.
    pub last_seen: u64,
    /// Process that last set the status.
    pub process: Option<String>,
    /// Session that last set the status.
    pub session: Option<String>,
}

impl PresenceRecord {
    /// Parse a record from its hash fields.
    ///
    /// Returns `None` for an empty hash or an unknown status.
    #[must_use]
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let status = fields.get(FIELD_STATUS)?.parse().ok()?;
        Some(Self {
            status,
            custom_status: fields
                .get(FIELD_CUSTOM_STATUS)
                .filter(|s| !s.is_empty())
                .cloned(),
            last_seen: fields
                .get(FIELD_LAST_SEEN)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            process: fields.get(FIELD_PROCESS).filter(|s| !s.is_empty()).cloned(),
            session: fields.get(FIELD_SESSION).filter(|s| !s.is_empty()).cloned(),
        })
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (FIELD_STATUS, self.status.to_string()),
            (
                FIELD_CUSTOM_STATUS,
                self.custom_status.clone().unwrap_or_default(),
            ),
            (FIELD_LAST_SEEN, self.last_seen.to_string()),
            (FIELD_PROCESS, self.process.clone().unwrap_or_default()),
            (FIELD_SESSION, self.session.clone().unwrap_or_default()),
        ]
    }
}

/// Where a user is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLocation {
    /// Sessions on this process.
    pub local_sessions: Vec<SessionId>,
    /// Process recorded as owner of the user's presence.
    pub process: Option<String>,
}

/// Presence tracker.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn CoordinationStore>,
    registry: Arc<SessionRegistry>,
    keys: Keys,
    process: ProcessId,
    ttl: Duration,
    timeout: Duration,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        registry: Arc<SessionRegistry>,
        keys: Keys,
        process: ProcessId,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            keys,
            process,
            ttl,
            timeout,
        }
    }

    async fn write(&self, user: &str, fields: &[(&str, String)]) {
        let key = self.keys.presence(user);
        if let Err(e) = with_timeout(
            self.timeout,
            self.store.hash_set(&key, fields, Some(self.ttl)),
        )
        .await
        {
            warn!(user = %user, error = %e, "Presence write failed");
        }
    }

    /// Mark a user online from a newly opened session.
    ///
    /// Upserts the record and refreshes its TTL.
    pub async fn set_online(&self, user: &str, session: &SessionId) {
        let record = PresenceRecord {
            status: UserStatus::Online,
            custom_status: None,
            last_seen: now_ms(),
            process: Some(self.process.to_string()),
            session: Some(session.to_string()),
        };
        // Keep a custom status set earlier from another device.
        let fields: Vec<_> = record
            .to_fields()
            .into_iter()
            .filter(|(name, _)| *name != FIELD_CUSTOM_STATUS)
            .collect();
        self.write(user, &fields).await;
        debug!(user = %user, session = %session, "User online");
    }

    /// Keep a connected user's record alive.
    ///
    /// Pushes the TTL forward and updates last-seen, keeping an explicitly
    /// set status. A missing or offline record is written as online again.
    pub async fn refresh(&self, user: &str, session: &SessionId) {
        match self.lookup(user).await {
            Some(record) if record.status != UserStatus::Offline => {
                self.write(user, &[(FIELD_LAST_SEEN, now_ms().to_string())])
                    .await;
            }
            _ => self.set_online(user, session).await,
        }
    }

    /// Mark a user offline. The record is kept with an updated last-seen.
    pub async fn set_offline(&self, user: &str) {
        let fields = [
            (FIELD_STATUS, UserStatus::Offline.to_string()),
            (FIELD_LAST_SEEN, now_ms().to_string()),
        ];
        self.write(user, &fields).await;
        debug!(user = %user, "User offline");
    }

    /// Explicit status change. Returns the record as written.
    pub async fn set_status(
        &self,
        user: &str,
        status: UserStatus,
        custom_status: Option<String>,
        session: &SessionId,
    ) -> PresenceRecord {
        let record = PresenceRecord {
            status,
            custom_status,
            last_seen: now_ms(),
            process: Some(self.process.to_string()),
            session: Some(session.to_string()),
        };
        self.write(user, &record.to_fields()).await;
        record
    }

    /// A user's record, or `None` when unknown or the store is unreachable.
    pub async fn lookup(&self, user: &str) -> Option<PresenceRecord> {
        let key = self.keys.presence(user);
        match with_timeout(self.timeout, self.store.hash_get_all(&key)).await {
            Ok(fields) => PresenceRecord::from_fields(&fields),
            Err(e) => {
                warn!(user = %user, error = %e, "Presence lookup failed");
                None
            }
        }
    }

    /// Whether a user is online anywhere.
    ///
    /// A local session counts even if the store is unreachable.
    pub async fn is_online(&self, user: &str) -> bool {
        if self.registry.user_has_sessions(user) {
            return true;
        }
        self.lookup(user)
            .await
            .map(|r| r.status != UserStatus::Offline)
            .unwrap_or(false)
    }

    /// Local sessions of a user plus the process owning their record.
    pub async fn locate(&self, user: &str) -> UserLocation {
        UserLocation {
            local_sessions: self.registry.sessions_for_user(user),
            process: self.lookup(user).await.and_then(|r| r.process),
        }
    }
}
