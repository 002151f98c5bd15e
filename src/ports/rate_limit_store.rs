use async_trait::async_trait;
use thiserror::Error;

/// Token bucket parameters for one rate-limited route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    /// Tokens added per second.
    pub replenish_rate: f64,
    /// Maximum number of tokens a bucket holds.
    pub burst_capacity: f64,
    /// Tokens spent by one request.
    pub requested_tokens: f64,
}

/// Bucket identity: the route plus the resolved client key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub route_id: String,
    pub key: String,
}

impl BucketKey {
    pub fn new(route_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.route_id, self.key)
    }
}

/// Outcome of one refill-and-consume step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumption {
    pub allowed: bool,
    pub tokens_left: f64,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RateLimitStoreError {
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected rate limit store reply: {0}")]
    Protocol(String),
}

/// Owner of token bucket state.
///
/// `consume` refills the bucket for the elapsed time, then spends
/// `requested_tokens` if enough are available. The whole step must be atomic
/// per key: two concurrent calls on a bucket holding one token never both
/// succeed.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn consume(
        &self,
        key: &BucketKey,
        config: &TokenBucketConfig,
    ) -> Result<Consumption, RateLimitStoreError>;

    fn describe(&self) -> String;
}
