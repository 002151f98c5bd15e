use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderName, StatusCode};
use serde::Deserialize;

use crate::{
    core::{
        error::GatewayResult,
        exchange::Exchange,
        filter::{Chain, GatewayFilter},
        rate_limiter::{
            GovernorRateLimiter, HeaderKeyResolver, KeyResolver, PrincipalNameKeyResolver,
            RateLimiter, RemoteAddrKeyResolver, TokenBucketRateLimiter,
        },
    },
    ports::rate_limit_store::{RateLimitStore, TokenBucketConfig},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyResolverArgs {
    Principal,
    RemoteAddr,
    Header { name: String },
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    /// Buckets kept in the configured rate-limit store.
    #[default]
    TokenBucket,
    /// Process-local `governor` limiter.
    Governor,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestRateLimiterArgs {
    pub replenish_rate: f64,
    pub burst_capacity: f64,
    pub requested_tokens: f64,
    pub key_resolver: KeyResolverArgs,
    pub deny_empty_key: bool,
    pub empty_key_status: u16,
    pub status_code: u16,
    pub include_headers: bool,
    pub limiter: LimiterKind,
}

impl Default for RequestRateLimiterArgs {
    fn default() -> Self {
        Self {
            replenish_rate: 1.0,
            burst_capacity: 1.0,
            requested_tokens: 1.0,
            key_resolver: KeyResolverArgs::Principal,
            deny_empty_key: true,
            empty_key_status: 403,
            status_code: 429,
            include_headers: true,
            limiter: LimiterKind::TokenBucket,
        }
    }
}

impl RequestRateLimiterArgs {
    pub fn bucket(&self) -> Result<TokenBucketConfig, String> {
        if !(self.replenish_rate > 0.0) {
            return Err("replenish_rate must be greater than 0".to_string());
        }
        if !(self.requested_tokens > 0.0) {
            return Err("requested_tokens must be greater than 0".to_string());
        }
        if self.burst_capacity < self.requested_tokens {
            return Err(format!(
                "burst_capacity ({}) must be at least requested_tokens ({})",
                self.burst_capacity, self.requested_tokens
            ));
        }
        Ok(TokenBucketConfig {
            replenish_rate: self.replenish_rate,
            burst_capacity: self.burst_capacity,
            requested_tokens: self.requested_tokens,
        })
    }
}

fn status(code: u16) -> Result<StatusCode, String> {
    StatusCode::from_u16(code).map_err(|e| format!("invalid status {code}: {e}"))
}

/// Meters requests per resolved key with a token bucket. Denied requests
/// complete with the deny status without reaching the rest of the chain.
pub struct RequestRateLimiterFilter {
    limiter: Arc<dyn RateLimiter>,
    resolver: Arc<dyn KeyResolver>,
    deny_empty_key: bool,
    empty_key_status: StatusCode,
    status_code: StatusCode,
}

impl RequestRateLimiterFilter {
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        resolver: Arc<dyn KeyResolver>,
        deny_empty_key: bool,
        empty_key_status: StatusCode,
        status_code: StatusCode,
    ) -> Self {
        Self {
            limiter,
            resolver,
            deny_empty_key,
            empty_key_status,
            status_code,
        }
    }

    /// Build from configuration; token buckets live in `store`.
    pub fn from_args(
        args: &RequestRateLimiterArgs,
        store: &Arc<dyn RateLimitStore>,
    ) -> Result<Self, String> {
        let bucket = args.bucket()?;
        let limiter: Arc<dyn RateLimiter> = match args.limiter {
            LimiterKind::TokenBucket => Arc::new(TokenBucketRateLimiter::new(
                bucket,
                Arc::clone(store),
                args.include_headers,
            )),
            LimiterKind::Governor => {
                Arc::new(GovernorRateLimiter::new(bucket, args.include_headers)?)
            }
        };
        let resolver: Arc<dyn KeyResolver> = match &args.key_resolver {
            KeyResolverArgs::Principal => Arc::new(PrincipalNameKeyResolver),
            KeyResolverArgs::RemoteAddr => Arc::new(RemoteAddrKeyResolver),
            KeyResolverArgs::Header { name } => Arc::new(HeaderKeyResolver::new(
                HeaderName::try_from(name.as_str())
                    .map_err(|e| format!("invalid header name '{name}': {e}"))?,
            )),
        };
        Ok(Self::new(
            limiter,
            resolver,
            args.deny_empty_key,
            status(args.empty_key_status)?,
            status(args.status_code)?,
        ))
    }
}

#[async_trait]
impl GatewayFilter for RequestRateLimiterFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        let key = self
            .resolver
            .resolve(exchange)
            .await
            .filter(|key| !key.is_empty());
        let Some(key) = key else {
            if self.deny_empty_key {
                tracing::debug!(resolver = %self.resolver.describe(), "Empty rate limit key, denying");
                exchange.response_mut().set_status(self.empty_key_status);
                return Ok(());
            }
            return chain.proceed(exchange).await;
        };

        let route_id = exchange.route_id().unwrap_or_default().to_string();
        let decision = self.limiter.is_allowed(&route_id, &key).await;
        let headers = exchange.response_mut().headers_mut();
        for (name, value) in decision.headers {
            headers.insert(name, value);
        }

        if decision.allowed {
            chain.proceed(exchange).await
        } else {
            tracing::debug!(route = %route_id, key = %key, "Rate limit exceeded");
            exchange.response_mut().set_status(self.status_code);
            Ok(())
        }
    }

    fn describe(&self) -> String {
        format!(
            "RequestRateLimiter: limiter=[{}] key_resolver={} deny_empty_key={}",
            self.limiter.describe(),
            self.resolver.describe(),
            self.deny_empty_key
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use axum::body::Body;
    use http::{Method, Uri};

    use super::*;
    use crate::{
        adapters::rate_limit_stores::memory::InMemoryRateLimitStore,
        core::{
            error::GatewayError,
            exchange::GatewayRequest,
            filter::{Dispatch, Forwarder, OrderedFilter},
        },
    };

    #[derive(Default)]
    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Forwarder for Counting {
        async fn forward(&self, exchange: &mut Exchange) -> GatewayResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            exchange.response_mut().set_status(StatusCode::OK);
            Ok(())
        }
    }

    struct NoDispatch;

    #[async_trait]
    impl Dispatch for NoDispatch {
        async fn dispatch(&self, _exchange: &mut Exchange) -> GatewayResult<()> {
            Err(GatewayError::FilterContractViolation("unexpected".into()))
        }
    }

    fn limiter_filter(args: RequestRateLimiterArgs) -> Vec<OrderedFilter> {
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryRateLimitStore::new());
        vec![OrderedFilter::new(
            1,
            Arc::new(RequestRateLimiterFilter::from_args(&args, &store).unwrap()),
        )]
    }

    fn exchange_from(addr: &str) -> Exchange {
        let remote: SocketAddr = addr.parse().unwrap();
        Exchange::new(
            GatewayRequest::new(Method::GET, Uri::from_static("/")).with_remote_addr(remote),
            Body::empty(),
        )
    }

    async fn send(filters: &[OrderedFilter], forwarder: &Counting, addr: &str) -> Exchange {
        let mut exchange = exchange_from(addr);
        Chain::new(filters, forwarder, &NoDispatch)
            .proceed(&mut exchange)
            .await
            .unwrap();
        exchange
    }

    fn remaining(exchange: &Exchange) -> &str {
        exchange.response().headers()["x-ratelimit-remaining"]
            .to_str()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_allow_allow_deny_then_refill() {
        let filters = limiter_filter(RequestRateLimiterArgs {
            replenish_rate: 1.0,
            burst_capacity: 2.0,
            key_resolver: KeyResolverArgs::RemoteAddr,
            ..RequestRateLimiterArgs::default()
        });
        let forwarder = Counting::default();

        let first = send(&filters, &forwarder, "10.0.0.1:5000").await;
        assert_eq!(first.response().status(), Some(StatusCode::OK));
        assert_eq!(remaining(&first), "1");

        let second = send(&filters, &forwarder, "10.0.0.1:5001").await;
        assert_eq!(second.response().status(), Some(StatusCode::OK));
        assert_eq!(remaining(&second), "0");

        let third = send(&filters, &forwarder, "10.0.0.1:5002").await;
        assert_eq!(third.response().status(), Some(StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(remaining(&third), "0");
        assert_eq!(
            third.response().headers()["x-ratelimit-burst-capacity"],
            "2"
        );
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        let fourth = send(&filters, &forwarder, "10.0.0.1:5003").await;
        assert_eq!(fourth.response().status(), Some(StatusCode::OK));
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 3);

        let other_client = send(&filters, &forwarder, "10.0.0.2:5000").await;
        assert_eq!(other_client.response().status(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_empty_key_is_denied_by_default() {
        let filters = limiter_filter(RequestRateLimiterArgs::default());
        let forwarder = Counting::default();
        let exchange = send(&filters, &forwarder, "10.0.0.1:5000").await;
        assert_eq!(exchange.response().status(), Some(StatusCode::FORBIDDEN));
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_key_passes_when_allowed() {
        let filters = limiter_filter(RequestRateLimiterArgs {
            deny_empty_key: false,
            ..RequestRateLimiterArgs::default()
        });
        let forwarder = Counting::default();
        let exchange = send(&filters, &forwarder, "10.0.0.1:5000").await;
        assert_eq!(exchange.response().status(), Some(StatusCode::OK));
        assert!(!exchange.response().headers().contains_key("x-ratelimit-remaining"));
    }

    #[test]
    fn test_invalid_bucket_is_rejected() {
        let args = RequestRateLimiterArgs {
            burst_capacity: 1.0,
            requested_tokens: 2.0,
            ..RequestRateLimiterArgs::default()
        };
        assert!(args.bucket().is_err());

        let args = RequestRateLimiterArgs {
            replenish_rate: 0.0,
            ..RequestRateLimiterArgs::default()
        };
        assert!(args.bucket().is_err());
    }
}
