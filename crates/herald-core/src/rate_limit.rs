//! Fixed-window rate limiting on store counters.
//!
//! A counter per (scope, user) lives at `ratelimit:{scope}:{user}`. The
//! increment that creates it sets its expiry, so the window starts at the
//! first counted action and the counter disappears when it ends.

use crate::store::{with_timeout, CoordinationStore, Keys};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Within the limit. Carries the count in the current window.
    Allowed(u64),
    /// Over the limit.
    Limited(u64),
    /// The store could not be reached; the action is let through.
    Unchecked,
}

impl RateDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateDecision::Limited(_))
    }
}

/// A fixed-window limiter for one scope (`connect`, `events`, ...).
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    keys: Keys,
    scope: &'static str,
    window: Duration,
    max: u64,
    timeout: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: Keys,
        scope: &'static str,
        window: Duration,
        max: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            scope,
            window,
            max,
            timeout,
        }
    }

    /// Count one action for `user` and decide whether it may proceed.
    ///
    /// A limit of 0 disables the limiter. Store failures fail open.
    pub async fn check(&self, user: &str) -> RateDecision {
        if self.max == 0 {
            return RateDecision::Allowed(0);
        }
        let key = self.keys.rate_limit(self.scope, user);
        match with_timeout(self.timeout, self.store.incr_with_expiry(&key, self.window)).await {
            Ok(count) if count > self.max => RateDecision::Limited(count),
            Ok(count) => RateDecision::Allowed(count),
            Err(e) => {
                warn!(
                    scope = self.scope,
                    user = %user,
                    error = %e,
                    "Rate limit check failed, allowing"
                );
                RateDecision::Unchecked
            }
        }
    }

    #[must_use]
    pub fn scope(&self) -> &'static str {
        self.scope
    }
}
