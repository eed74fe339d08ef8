//! Session acquisition and refresh-before-expiry caching

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use services_common::IngestResult;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Credentials presented to the upstream
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Bearer token or API key
    pub token: String,
    /// Hard expiry
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Session {
    /// Whether the session should be replaced at `now`
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: ChronoDuration) -> bool {
        now + margin >= self.expires_at
    }

    /// Time left before refresh is due
    #[must_use]
    pub fn refresh_in(&self, now: DateTime<Utc>, margin: ChronoDuration) -> Duration {
        (self.expires_at - margin - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// The external "get a valid session" capability
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Obtain a fresh session
    async fn get_session(&self) -> IngestResult<Session>;
}

/// Provider for long-lived API keys
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
    ttl: ChronoDuration,
}

impl StaticTokenProvider {
    /// Wrap an API key, re-issued every `ttl`
    #[must_use]
    pub fn new(token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token: token.into(),
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1)),
        }
    }
}

#[async_trait]
impl SessionProvider for StaticTokenProvider {
    async fn get_session(&self) -> IngestResult<Session> {
        Ok(Session {
            token: self.token.clone(),
            expires_at: Utc::now() + self.ttl,
        })
    }
}

/// Shares one session between the stream and the poller
///
/// Refreshes `margin` ahead of expiry and on explicit invalidation after an
/// auth rejection.
pub struct SessionCache {
    provider: Box<dyn SessionProvider>,
    margin: ChronoDuration,
    current: Mutex<Option<Session>>,
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("margin", &self.margin)
            .finish_non_exhaustive()
    }
}

impl SessionCache {
    /// Cache over a provider
    #[must_use]
    pub fn new(provider: Box<dyn SessionProvider>, margin: Duration) -> Self {
        Self {
            provider,
            margin: ChronoDuration::from_std(margin).unwrap_or_else(|_| ChronoDuration::minutes(1)),
            current: Mutex::new(None),
        }
    }

    /// Refresh margin
    #[must_use]
    pub const fn margin(&self) -> ChronoDuration {
        self.margin
    }

    /// A session valid for at least the refresh margin
    pub async fn get(&self) -> IngestResult<Session> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.needs_refresh(Utc::now(), self.margin) {
                return Ok(session.clone());
            }
            debug!(expires_at = %session.expires_at, "Session due for refresh");
        }
        let session = self.provider.get_session().await?;
        info!(expires_at = %session.expires_at, "Session refreshed");
        *current = Some(session.clone());
        Ok(session)
    }

    /// Drop the cached session so the next `get` asks the provider
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        calls: Arc<AtomicU32>,
        ttl: ChronoDuration,
    }

    #[async_trait]
    impl SessionProvider for CountingProvider {
        async fn get_session(&self) -> IngestResult<Session> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                token: format!("token-{n}"),
                expires_at: Utc::now() + self.ttl,
            })
        }
    }

    #[tokio::test]
    async fn test_cache_reuses_until_invalidated() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = SessionCache::new(
            Box::new(CountingProvider {
                calls: calls.clone(),
                ttl: ChronoDuration::hours(1),
            }),
            Duration::from_secs(60),
        );
        assert_eq!(cache.get().await.unwrap().token, "token-0");
        assert_eq!(cache.get().await.unwrap().token, "token-0");
        cache.invalidate().await;
        assert_eq!(cache.get().await.unwrap().token, "token-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_refreshes_inside_margin() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = SessionCache::new(
            Box::new(CountingProvider {
                calls: calls.clone(),
                ttl: ChronoDuration::seconds(30),
            }),
            Duration::from_secs(60),
        );
        cache.get().await.unwrap();
        cache.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let session = Session {
            token: "secret".into(),
            expires_at: Utc::now(),
        };
        assert!(!format!("{session:?}").contains("secret"));
    }
}
