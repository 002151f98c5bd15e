//! Token bucket rate limiting.
//!
//! [`TokenBucketRateLimiter`] delegates bucket state to a [`RateLimitStore`]
//! (in-memory or Redis) so the refill-and-consume step stays atomic per key
//! wherever the state lives. [`GovernorRateLimiter`] is a process-local
//! alternative built on `governor`'s keyed GCRA limiter. Both report their
//! verdict as a [`RateLimitDecision`] carrying the informational headers.
use std::{num::NonZeroU32, sync::Arc, time::Duration};

use async_trait::async_trait;
use governor::{
    Quota, RateLimiter as GovernorLimiter, clock::DefaultClock,
    middleware::StateInformationMiddleware, state::keyed::DefaultKeyedStateStore,
};
use http::{HeaderName, HeaderValue};
use tokio::time::Instant;

use crate::{
    core::exchange::Exchange,
    ports::rate_limit_store::{BucketKey, Consumption, RateLimitStore, TokenBucketConfig},
};

pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const REPLENISH_RATE_HEADER: HeaderName =
    HeaderName::from_static("x-ratelimit-replenish-rate");
pub const BURST_CAPACITY_HEADER: HeaderName =
    HeaderName::from_static("x-ratelimit-burst-capacity");
pub const REQUESTED_TOKENS_HEADER: HeaderName =
    HeaderName::from_static("x-ratelimit-requested-tokens");

/// Bucket state as kept by in-process stores.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    /// When the bucket is back at burst capacity, `None` if it never refills.
    full_at: Option<Instant>,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn full(config: &TokenBucketConfig, now: Instant) -> Self {
        Self {
            tokens: config.burst_capacity,
            last_refill: now,
            full_at: Some(now),
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// True once enough time has passed for the bucket to refill to burst
    /// capacity, so a fresh full bucket would behave identically.
    pub fn is_full_at(&self, now: Instant) -> bool {
        self.full_at.is_some_and(|full_at| now >= full_at)
    }

    /// Refill for the time elapsed since the last call, then try to spend
    /// `requested_tokens`.
    pub fn consume(&mut self, config: &TokenBucketConfig, now: Instant) -> Consumption {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.replenish_rate).min(config.burst_capacity);
        self.last_refill = now;

        let allowed = self.tokens >= config.requested_tokens;
        if allowed {
            self.tokens -= config.requested_tokens;
        }
        let deficit = config.burst_capacity - self.tokens;
        self.full_at = if deficit <= 0.0 {
            Some(now)
        } else {
            Duration::try_from_secs_f64(deficit / config.replenish_rate)
                .ok()
                .and_then(|refill| now.checked_add(refill))
        };
        Consumption {
            allowed,
            tokens_left: self.tokens,
        }
    }
}

/// Verdict for one request.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole tokens left after this request, `-1` when unknown.
    pub tokens_remaining: i64,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn is_allowed(&self, route_id: &str, key: &str) -> RateLimitDecision;

    fn describe(&self) -> String;
}

fn decision(
    config: &TokenBucketConfig,
    include_headers: bool,
    allowed: bool,
    tokens_remaining: i64,
) -> RateLimitDecision {
    let mut headers = vec![(REMAINING_HEADER, HeaderValue::from(tokens_remaining))];
    if include_headers {
        for (name, value) in [
            (REPLENISH_RATE_HEADER, config.replenish_rate),
            (BURST_CAPACITY_HEADER, config.burst_capacity),
            (REQUESTED_TOKENS_HEADER, config.requested_tokens),
        ] {
            if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
                headers.push((name, value));
            }
        }
    }
    RateLimitDecision {
        allowed,
        tokens_remaining,
        headers,
    }
}

pub struct TokenBucketRateLimiter {
    config: TokenBucketConfig,
    store: Arc<dyn RateLimitStore>,
    include_headers: bool,
}

impl TokenBucketRateLimiter {
    pub fn new(
        config: TokenBucketConfig,
        store: Arc<dyn RateLimitStore>,
        include_headers: bool,
    ) -> Self {
        Self {
            config,
            store,
            include_headers,
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketRateLimiter {
    async fn is_allowed(&self, route_id: &str, key: &str) -> RateLimitDecision {
        let bucket = BucketKey::new(route_id, key);
        match self.store.consume(&bucket, &self.config).await {
            Ok(consumption) => {
                tracing::debug!(
                    bucket = %bucket,
                    allowed = consumption.allowed,
                    tokens_left = consumption.tokens_left,
                    "Rate limit evaluated"
                );
                decision(
                    &self.config,
                    self.include_headers,
                    consumption.allowed,
                    consumption.tokens_left.floor() as i64,
                )
            }
            Err(e) => {
                // Fail open: an unavailable store must not take the route down.
                tracing::warn!(bucket = %bucket, error = %e, "Rate limit store failed, allowing request");
                decision(&self.config, self.include_headers, true, -1)
            }
        }
    }

    fn describe(&self) -> String {
        format!(
            "TokenBucket: replenish_rate={} burst_capacity={} requested_tokens={} store={}",
            self.config.replenish_rate,
            self.config.burst_capacity,
            self.config.requested_tokens,
            self.store.describe()
        )
    }
}

type KeyedLimiter = GovernorLimiter<
    String,
    DefaultKeyedStateStore<String>,
    DefaultClock,
    StateInformationMiddleware,
>;

/// Process-local limiter backed by `governor`. Integer rates only.
pub struct GovernorRateLimiter {
    limiter: KeyedLimiter,
    config: TokenBucketConfig,
    requested: NonZeroU32,
    include_headers: bool,
}

impl GovernorRateLimiter {
    pub fn new(config: TokenBucketConfig, include_headers: bool) -> Result<Self, String> {
        let whole = |value: f64, field: &str| {
            if value.fract() != 0.0 {
                return Err(format!("{field} must be a whole number for the governor limiter"));
            }
            NonZeroU32::new(value as u32).ok_or_else(|| format!("{field} must be greater than 0"))
        };
        let rate = whole(config.replenish_rate, "replenish_rate")?;
        let burst = whole(config.burst_capacity, "burst_capacity")?;
        let requested = whole(config.requested_tokens, "requested_tokens")?;

        let quota = Quota::per_second(rate).allow_burst(burst);
        let limiter = GovernorLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>();
        Ok(Self {
            limiter,
            config,
            requested,
            include_headers,
        })
    }
}

#[async_trait]
impl RateLimiter for GovernorRateLimiter {
    async fn is_allowed(&self, route_id: &str, key: &str) -> RateLimitDecision {
        let bucket = format!("{route_id}.{key}");
        let (allowed, remaining) = match self.limiter.check_key_n(&bucket, self.requested) {
            Ok(Ok(snapshot)) => (true, i64::from(snapshot.remaining_burst_capacity())),
            Ok(Err(_)) | Err(_) => (false, 0),
        };
        decision(&self.config, self.include_headers, allowed, remaining)
    }

    fn describe(&self) -> String {
        format!(
            "Governor: replenish_rate={} burst_capacity={} requested_tokens={}",
            self.config.replenish_rate, self.config.burst_capacity, self.config.requested_tokens
        )
    }
}

/// Maps an exchange to the key its bucket is tracked under.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, exchange: &Exchange) -> Option<String>;

    fn describe(&self) -> String;
}

/// Keys by the authenticated principal.
pub struct PrincipalNameKeyResolver;

#[async_trait]
impl KeyResolver for PrincipalNameKeyResolver {
    async fn resolve(&self, exchange: &Exchange) -> Option<String> {
        exchange.attributes().principal.clone()
    }

    fn describe(&self) -> String {
        "principal".to_string()
    }
}

/// Keys by the client IP of the inbound connection.
pub struct RemoteAddrKeyResolver;

#[async_trait]
impl KeyResolver for RemoteAddrKeyResolver {
    async fn resolve(&self, exchange: &Exchange) -> Option<String> {
        exchange.request().remote_addr.map(|addr| addr.ip().to_string())
    }

    fn describe(&self) -> String {
        "remote_addr".to_string()
    }
}

/// Keys by the first value of a request header.
pub struct HeaderKeyResolver {
    name: HeaderName,
}

impl HeaderKeyResolver {
    pub fn new(name: HeaderName) -> Self {
        Self { name }
    }
}

#[async_trait]
impl KeyResolver for HeaderKeyResolver {
    async fn resolve(&self, exchange: &Exchange) -> Option<String> {
        exchange
            .request()
            .headers
            .get(&self.name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn describe(&self) -> String {
        format!("header:{}", self.name)
    }
}
