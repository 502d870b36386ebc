//! Bearer token sources for remote tool servers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::types::CallContext;
use crate::config::EnvSource;

pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(300);
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    /// `None` when the issuer did not say.
    pub expires_at: Option<Instant>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// No token is available for this caller; the request goes out without one.
    #[error("no access token available: {0}")]
    Missing(String),
    #[error("token acquisition failed: {0}")]
    Upstream(String),
}

#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, ctx: &CallContext) -> Result<AccessToken, TokenError>;

    /// Identity a token is cached under.
    fn cache_key(&self, ctx: &CallContext) -> String;
}

/// Uses the caller's own token.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedTokenSource;

#[async_trait::async_trait]
impl TokenSource for ForwardedTokenSource {
    async fn token(&self, ctx: &CallContext) -> Result<AccessToken, TokenError> {
        ctx.access_token
            .clone()
            .map(AccessToken::new)
            .ok_or_else(|| TokenError::Missing("caller did not supply a token".to_string()))
    }

    fn cache_key(&self, ctx: &CallContext) -> String {
        ctx.access_token.clone().unwrap_or_default()
    }
}

/// Reads the token from an environment variable.
pub struct EnvTokenSource {
    var: String,
    env: Arc<dyn EnvSource>,
}

impl EnvTokenSource {
    pub fn new(var: impl Into<String>, env: Arc<dyn EnvSource>) -> Self {
        Self {
            var: var.into(),
            env,
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for EnvTokenSource {
    async fn token(&self, _ctx: &CallContext) -> Result<AccessToken, TokenError> {
        match self.env.var(&self.var) {
            Some(v) if !v.is_empty() => Ok(AccessToken::new(v)),
            _ => Err(TokenError::Missing(format!(
                "environment variable '{}' is not set",
                self.var
            ))),
        }
    }

    fn cache_key(&self, _ctx: &CallContext) -> String {
        format!("env:{}", self.var)
    }
}

enum CacheEntry {
    Token(AccessToken, Instant),
    Failed(TokenError, Instant),
}

type Slot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

/// Caches an inner source per caller identity.
///
/// Tokens are reused until `expires_at - buffer`; failures are replayed for
/// `failure_backoff`. Concurrent misses on one key share a single fetch.
pub struct CachedTokenSource<S> {
    inner: S,
    buffer: Duration,
    default_ttl: Duration,
    failure_backoff: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl<S: TokenSource> CachedTokenSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: DEFAULT_EXPIRY_BUFFER,
            default_ttl: DEFAULT_TOKEN_TTL,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    pub fn invalidate(&self, key: &str) {
        self.lock_slots().remove(key);
    }

    pub fn clear(&self) {
        self.lock_slots().clear();
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, key: &str) -> Slot {
        self.lock_slots()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }
}

#[async_trait::async_trait]
impl<S: TokenSource> TokenSource for CachedTokenSource<S> {
    async fn token(&self, ctx: &CallContext) -> Result<AccessToken, TokenError> {
        let key = self.inner.cache_key(ctx);
        let slot = self.slot(&key);
        let mut entry = slot.lock().await;
        let now = Instant::now();
        match &*entry {
            Some(CacheEntry::Token(tok, refresh_at)) if now < *refresh_at => {
                return Ok(tok.clone());
            }
            Some(CacheEntry::Failed(err, retry_at)) if now < *retry_at => {
                return Err(err.clone());
            }
            _ => {}
        }

        debug!("fetching access token");
        match self.inner.token(ctx).await {
            Ok(tok) => {
                let expires = tok.expires_at.unwrap_or(now + self.default_ttl);
                let refresh_at = expires.checked_sub(self.buffer).unwrap_or(now);
                *entry = Some(CacheEntry::Token(tok.clone(), refresh_at));
                Ok(tok)
            }
            Err(err) => {
                *entry = Some(CacheEntry::Failed(err.clone(), now + self.failure_backoff));
                Err(err)
            }
        }
    }

    fn cache_key(&self, ctx: &CallContext) -> String {
        self.inner.cache_key(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: bool,
        lifetime: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl TokenSource for Counting {
        async fn token(&self, ctx: &CallContext) -> Result<AccessToken, TokenError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(TokenError::Upstream(format!("boom {n}")));
            }
            Ok(AccessToken {
                token: format!("{}-{n}", ctx.access_token.clone().unwrap_or_default()),
                expires_at: self.lifetime.map(|d| Instant::now() + d),
            })
        }

        fn cache_key(&self, ctx: &CallContext) -> String {
            ctx.access_token.clone().unwrap_or_default()
        }
    }

    fn counting(fail: bool, lifetime: Option<Duration>) -> (Arc<AtomicUsize>, Counting) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            calls.clone(),
            Counting {
                calls,
                fail,
                lifetime,
            },
        )
    }

    #[tokio::test]
    async fn forwarded_requires_caller_token() {
        let src = ForwardedTokenSource;
        assert!(matches!(
            src.token(&CallContext::default()).await,
            Err(TokenError::Missing(_))
        ));
        let tok = src.token(&CallContext::with_token("abc")).await.unwrap();
        assert_eq!(tok.token, "abc");
    }

    #[tokio::test]
    async fn env_source_reads_variable() {
        let env: HashMap<String, String> =
            [("DOCS_TOKEN".to_string(), "secret".to_string())].into();
        let src = EnvTokenSource::new("DOCS_TOKEN", Arc::new(env));
        assert_eq!(src.token(&CallContext::default()).await.unwrap().token, "secret");
        let missing = EnvTokenSource::new("OTHER", Arc::new(HashMap::<String, String>::new()));
        assert!(missing.token(&CallContext::default()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn caches_until_buffer_before_expiry() {
        let (calls, inner) = counting(false, Some(Duration::from_secs(600)));
        let cache = CachedTokenSource::new(inner);
        let ctx = CallContext::with_token("user");
        let first = cache.token(&ctx).await.unwrap();
        let second = cache.token(&ctx).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // 600s lifetime minus 300s buffer
        tokio::time::advance(Duration::from_secs(301)).await;
        let third = cache.token(&ctx).await.unwrap();
        assert_ne!(first.token, third.token);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_isolated_and_invalidation_refetches() {
        let (calls, inner) = counting(false, None);
        let cache = CachedTokenSource::new(inner);
        cache.token(&CallContext::with_token("a")).await.unwrap();
        cache.token(&CallContext::with_token("b")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        cache.invalidate("a");
        cache.token(&CallContext::with_token("a")).await.unwrap();
        cache.token(&CallContext::with_token("b")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        cache.clear();
        cache.token(&CallContext::with_token("b")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_replayed_during_backoff() {
        let (calls, inner) = counting(true, None);
        let cache = CachedTokenSource::new(inner).with_failure_backoff(Duration::from_secs(10));
        let ctx = CallContext::with_token("u");
        let e1 = cache.token(&ctx).await.unwrap_err();
        let e2 = cache.token(&ctx).await.unwrap_err();
        assert_eq!(e1, e2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.token(&ctx).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let (calls, inner) = counting(false, None);
        let cache = Arc::new(CachedTokenSource::new(inner));
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let c = cache.clone();
            set.spawn(async move { c.token(&CallContext::with_token("same")).await });
        }
        let mut tokens = Vec::new();
        while let Some(r) = set.join_next().await {
            tokens.push(r.unwrap().unwrap().token);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }
}
