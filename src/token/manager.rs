use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{CredentialLease, TokenError, TokenFetcher};

/// Hands out [`TokenSource`]s sharing one expiry policy.
#[derive(Debug, Clone)]
pub struct TokenManager {
    expiry_delta: Duration,
}

impl TokenManager {
    pub fn new(expiry_delta: Duration) -> Self {
        Self { expiry_delta }
    }

    /// Wrap `base` into a source that refreshes through `fetcher` once it runs out.
    pub fn token_source(
        &self,
        base: CredentialLease,
        fetcher: Arc<dyn TokenFetcher>,
    ) -> TokenSource {
        TokenSource {
            inner: Arc::new(Inner {
                cached: Mutex::new(Some(base)),
                fetcher,
                expiry_delta: self.expiry_delta,
                refreshes: AtomicU64::new(0),
            }),
        }
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

struct Inner {
    // Held across the fetch so concurrent callers wait for one refresh.
    cached: Mutex<Option<CredentialLease>>,
    fetcher: Arc<dyn TokenFetcher>,
    expiry_delta: Duration,
    refreshes: AtomicU64,
}

#[derive(Clone)]
pub struct TokenSource {
    inner: Arc<Inner>,
}

impl TokenSource {
    /// Current lease, refreshed first if it would expire within the delta.
    ///
    /// A failed refresh is returned to the caller; the stale lease is dropped
    /// rather than served.
    pub async fn token(&self) -> Result<CredentialLease, TokenError> {
        self.token_within(self.inner.expiry_delta).await
    }

    /// Like [`token`](Self::token) but refreshes once the lease has less than
    /// `margin` left. Used for renewal ahead of expiry.
    pub async fn refresh_within(&self, margin: Duration) -> Result<CredentialLease, TokenError> {
        self.token_within(margin.max(self.inner.expiry_delta)).await
    }

    async fn token_within(&self, margin: Duration) -> Result<CredentialLease, TokenError> {
        let mut cached = self.inner.cached.lock().await;

        if let Some(lease) = cached.as_ref() {
            if lease.is_valid(margin) {
                return Ok(lease.clone());
            }
        }

        self.inner.refreshes.fetch_add(1, Ordering::Relaxed);
        let fresh = match self.inner.fetcher.fetch().await {
            Ok(lease) => lease,
            Err(e) => {
                if cached.as_ref().is_some_and(|l| !l.is_valid(Duration::ZERO)) {
                    *cached = None;
                }
                tracing::warn!(error = %e, "Token refresh failed");
                return Err(e);
            }
        };

        if !fresh.is_valid(Duration::ZERO) {
            return Err(TokenError::Expired(fresh.expiry));
        }

        tracing::debug!(expiry = %fresh.expiry, "Refreshed credential lease");
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    /// Force the next [`token`](Self::token) call to refresh.
    pub async fn invalidate(&self) {
        *self.inner.cached.lock().await = None;
    }

    /// Expiry of the cached lease, if any.
    pub async fn expiry(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner.cached.lock().await.as_ref().map(|l| l.expiry)
    }

    /// Headroom every lease handed out by [`token`](Self::token) has left.
    pub fn expiry_delta(&self) -> Duration {
        self.inner.expiry_delta
    }

    /// Number of refresh attempts made so far.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSource")
            .field("expiry_delta", &self.inner.expiry_delta)
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::fetcher::MockTokenFetcher;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    struct CountingFetcher {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
        delay: Duration,
    }

    #[async_trait]
    impl TokenFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<CredentialLease, TokenError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            Ok(CredentialLease::new(format!("token-{n}"), Utc::now() + self.lifetime))
        }
    }

    fn counting(lifetime_ms: i64, delay_ms: u64) -> Arc<CountingFetcher> {
        Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::milliseconds(lifetime_ms),
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[tokio::test]
    async fn test_valid_base_token_is_served_without_refresh() {
        let fetcher = counting(60_000, 0);
        let source = TokenManager::new(Duration::from_secs(10)).token_source(
            CredentialLease::new("base", Utc::now() + chrono::Duration::hours(1)),
            fetcher.clone(),
        );

        assert_eq!(source.token().await.unwrap().access_token, "base");
        assert_eq!(source.token().await.unwrap().access_token, "base");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_token_inside_delta_is_refreshed() {
        let fetcher = counting(60_000, 0);
        let source = TokenManager::new(Duration::from_secs(10)).token_source(
            CredentialLease::new("base", Utc::now() + chrono::Duration::seconds(5)),
            fetcher.clone(),
        );

        let lease = source.token().await.unwrap();
        assert_eq!(lease.access_token, "token-1");
        assert_eq!(source.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_never_returns_expired_token_across_boundary() {
        let fetcher = counting(150, 0);
        let source = TokenManager::new(Duration::from_millis(30)).token_source(
            CredentialLease::new("base", Utc::now() + chrono::Duration::milliseconds(100)),
            fetcher.clone(),
        );

        for _ in 0..10 {
            let lease = source.token().await.unwrap();
            assert!(lease.expiry > Utc::now(), "served an expired lease");
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert!(fetcher.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let fetcher = counting(60_000, 50);
        let source = TokenManager::new(Duration::from_secs(1)).token_source(
            CredentialLease::new("base", Utc::now() - chrono::Duration::seconds(1)),
            fetcher.clone(),
        );

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let source = source.clone();
                tokio::spawn(async move { source.token().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().access_token, "token-1");
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_surfaced() {
        let mut fetcher = MockTokenFetcher::new();
        fetcher
            .expect_fetch()
            .times(2)
            .returning(|| Err(TokenError::Refresh("identity revoked".into())));

        let source = TokenManager::default().token_source(
            CredentialLease::new("base", Utc::now() - chrono::Duration::seconds(1)),
            Arc::new(fetcher),
        );

        assert!(matches!(source.token().await, Err(TokenError::Refresh(_))));
        // The stale lease is gone, the next call tries again instead of serving it.
        assert!(matches!(source.token().await, Err(TokenError::Refresh(_))));
        assert!(source.expiry().await.is_none());
    }

    #[tokio::test]
    async fn test_fetcher_returning_expired_lease_is_an_error() {
        let mut fetcher = MockTokenFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|| Ok(CredentialLease::new("old", Utc::now() - chrono::Duration::seconds(5))));

        let source = TokenManager::default().token_source(
            CredentialLease::new("base", Utc::now()),
            Arc::new(fetcher),
        );
        assert!(matches!(source.token().await, Err(TokenError::Expired(_))));
    }

    #[tokio::test]
    async fn test_refresh_within_renews_ahead_of_expiry() {
        let fetcher = counting(3_600_000, 0);
        let source = TokenManager::default().token_source(
            CredentialLease::new("base", Utc::now() + chrono::Duration::minutes(2)),
            fetcher.clone(),
        );

        // Outside the ten second delta, so a plain token() keeps the base lease.
        assert_eq!(source.token().await.unwrap().access_token, "base");

        let lease = source.refresh_within(Duration::from_secs(300)).await.unwrap();
        assert_eq!(lease.access_token, "token-1");
        assert_eq!(source.token().await.unwrap().access_token, "token-1");
    }

    #[tokio::test]
    async fn test_failed_early_refresh_keeps_valid_lease() {
        let mut fetcher = MockTokenFetcher::new();
        fetcher.expect_fetch().returning(|| Err(TokenError::Refresh("unreachable".into())));
        let source = TokenManager::default().token_source(
            CredentialLease::new("base", Utc::now() + chrono::Duration::minutes(2)),
            Arc::new(fetcher),
        );

        assert!(source.refresh_within(Duration::from_secs(300)).await.is_err());
        assert_eq!(source.token().await.unwrap().access_token, "base");
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let fetcher = counting(60_000, 0);
        let source = TokenManager::default().token_source(
            CredentialLease::new("base", Utc::now() + chrono::Duration::hours(1)),
            fetcher.clone(),
        );

        source.invalidate().await;
        assert_eq!(source.token().await.unwrap().access_token, "token-1");
    }
}
