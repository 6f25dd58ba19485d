/// Short-lived bearer token cache.
///
/// A token is treated as expired `refresh_buffer_ms` before the provider's
/// stated expiry so that a connection opened at the edge of its lifetime is
/// not rejected mid-handshake.
#[derive(Debug, Clone)]
pub struct TokenCache {
    cached: Option<CachedToken>,
    expiry_ms: u64,
    refresh_buffer_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub token: String,
    pub fetched_at_ms: u64,
}

pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl TokenCache {
    pub fn new(expiry_ms: u64, refresh_buffer_ms: u64) -> Self {
        Self {
            cached: None,
            expiry_ms,
            refresh_buffer_ms,
        }
    }

    /// Usable lifetime of a cached token.
    pub fn lifetime_ms(&self) -> u64 {
        self.expiry_ms.saturating_sub(self.refresh_buffer_ms)
    }

    pub fn cache_token(&mut self, token: &str) {
        self.cache_token_at(token, now_ms());
    }

    /// Every call restamps the fetch time, including for the token already held.
    pub fn cache_token_at(&mut self, token: &str, now_ms: u64) {
        if token.is_empty() {
            return;
        }
        self.cached = Some(CachedToken {
            token: token.to_string(),
            fetched_at_ms: now_ms,
        });
    }

    pub fn is_token_valid(&self) -> bool {
        self.is_token_valid_at(now_ms())
    }

    pub fn is_token_valid_at(&self, now_ms: u64) -> bool {
        match &self.cached {
            Some(cached) => now_ms.saturating_sub(cached.fetched_at_ms) < self.lifetime_ms(),
            None => false,
        }
    }

    pub fn get_cached_token(&self) -> Option<String> {
        self.get_cached_token_at(now_ms())
    }

    pub fn get_cached_token_at(&self, now_ms: u64) -> Option<String> {
        if !self.is_token_valid_at(now_ms) {
            return None;
        }
        self.cached.as_ref().map(|c| c.token.clone())
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }
}
