//! Sliding-window request throttling.
//!
//! Each middleware instance is identified by a signature derived from its
//! `(max_requests, time_window_ms)` pair. Instances with the same pair that
//! share one [`RateLimitStorage`] also share counters; different pairs never
//! see each other's trackers.
//!
//! The tracker is loaded, checked and saved across storage round-trips with
//! no lock held, so concurrent calls on one key can both observe a count
//! below the limit and both be admitted.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};

use super::{Middleware, Next};
use crate::clock::{Clock, SystemClock};
use crate::error::GenError;
use crate::provider::{GenerationOptions, GenerationResult};
use crate::store::{RateLimitStorage, RateLimitTracker};

pub const DEFAULT_KEY: &str = "global";

/// How the partition key of a call is chosen.
pub enum KeySource<I> {
    Fixed(String),
    Derived(Arc<dyn Fn(&I, &GenerationOptions) -> String + Send + Sync>),
}

impl<I> KeySource<I> {
    pub fn derived(f: impl Fn(&I, &GenerationOptions) -> String + Send + Sync + 'static) -> Self {
        Self::Derived(Arc::new(f))
    }

    fn resolve(&self, input: &I, options: &GenerationOptions) -> String {
        match self {
            Self::Fixed(key) => key.clone(),
            Self::Derived(f) => f(input, options),
        }
    }
}

impl<I> Default for KeySource<I> {
    fn default() -> Self {
        Self::Fixed(DEFAULT_KEY.to_string())
    }
}

impl<I> fmt::Debug for KeySource<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(key) => f.debug_tuple("Fixed").field(key).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Passed to the exceeded handler when a call would go over the limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub key: String,
    pub current_count: usize,
    pub max_requests: usize,
    pub time_window_ms: u64,
    pub remaining_ms: u64,
}

/// Decides whether an over-limit call may proceed anyway.
pub type ExceededHandler = Arc<dyn Fn(RateLimitInfo) -> BoxFuture<'static, bool> + Send + Sync>;

pub struct RateLimitOptions<I> {
    pub max_requests: usize,
    pub time_window_ms: u64,
    pub key: KeySource<I>,
    pub on_exceeded: Option<ExceededHandler>,
}

impl<I> RateLimitOptions<I> {
    pub fn new(max_requests: usize, time_window_ms: u64) -> Self {
        Self {
            max_requests,
            time_window_ms,
            key: KeySource::default(),
            on_exceeded: None,
        }
    }

    pub fn key(mut self, key: KeySource<I>) -> Self {
        self.key = key;
        self
    }

    pub fn on_exceeded<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(RateLimitInfo) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        self.on_exceeded = Some(Arc::new(move |info| -> BoxFuture<'static, bool> {
            Box::pin(handler(info))
        }));
        self
    }
}

/// Stable identifier of a rate-limit configuration.
pub fn instance_signature(max_requests: usize, time_window_ms: u64) -> String {
    let digest = Sha256::digest(format!("{max_requests}:{time_window_ms}").as_bytes());
    format!("ratelimit-{}", &hex::encode(digest)[..16])
}

pub struct RateLimitMiddleware<I> {
    options: RateLimitOptions<I>,
    signature: String,
    storage: Arc<RateLimitStorage>,
    clock: Arc<dyn Clock>,
}

impl<I> RateLimitMiddleware<I> {
    pub fn new(options: RateLimitOptions<I>, storage: Arc<RateLimitStorage>) -> Self {
        let signature = instance_signature(options.max_requests, options.time_window_ms);
        Self {
            options,
            signature,
            storage,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Record a request for `key`, or fail if the window is full.
    async fn admit(&self, key: &str) -> Result<(), GenError> {
        let now = self.clock.now_ms();
        let window = self.options.time_window_ms;
        let max_requests = self.options.max_requests;

        let mut tracker = self
            .storage
            .load(&self.signature, key)
            .await
            .unwrap_or_else(|| RateLimitTracker::new(now));

        // Lazy cleanup: only once per window, not on every call.
        if now.saturating_sub(tracker.last_cleanup) > window {
            tracker.timestamps.retain(|ts| now.saturating_sub(*ts) < window);
            tracker.last_cleanup = now;
        }

        let current_count = tracker.timestamps.len();
        if current_count >= max_requests {
            let oldest = tracker.timestamps.iter().min().copied().unwrap_or(now);
            let remaining_ms = oldest.saturating_add(window).saturating_sub(now);
            let info = RateLimitInfo {
                key: key.to_string(),
                current_count,
                max_requests,
                time_window_ms: window,
                remaining_ms,
            };

            let permitted = match &self.options.on_exceeded {
                Some(handler) => handler(info.clone()).await,
                None => false,
            };
            if !permitted {
                tracing::debug!(key, current_count, max_requests, remaining_ms, "rate limit exceeded");
                return Err(GenError::RateLimited {
                    key: info.key,
                    current_count,
                    max_requests,
                    time_window_ms: window,
                    remaining_ms,
                });
            }
            tracing::info!(key, current_count, max_requests, "rate limit exceeded, call permitted by handler");
        }

        tracker.timestamps.push(now);
        self.storage.save(&self.signature, key, &tracker).await;
        tracing::debug!(key, count = tracker.timestamps.len(), max_requests, "request admitted");
        Ok(())
    }
}

impl<I: Send + 'static> Middleware<I> for RateLimitMiddleware<I> {
    fn handle<'a>(
        &'a self,
        input: I,
        options: &'a GenerationOptions,
        next: Next<'a, I>,
    ) -> BoxFuture<'a, Result<GenerationResult, GenError>> {
        Box::pin(async move {
            let key = self.options.key.resolve(&input, options);
            self.admit(&key).await?;
            next.run(input, options).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_depends_only_on_configuration() {
        assert_eq!(instance_signature(5, 1000), instance_signature(5, 1000));
        assert_ne!(instance_signature(5, 1000), instance_signature(5, 2000));
        assert_ne!(instance_signature(5, 1000), instance_signature(6, 1000));
        assert!(instance_signature(1, 1).starts_with("ratelimit-"));
    }
}
