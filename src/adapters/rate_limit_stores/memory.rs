use std::time::Duration;

use async_trait::async_trait;
use scc::HashMap;
use tokio::time::Instant;

use crate::{
    core::rate_limiter::TokenBucket,
    ports::rate_limit_store::{
        BucketKey, Consumption, RateLimitStore, RateLimitStoreError, TokenBucketConfig,
    },
};

/// Token buckets held in process memory.
///
/// `scc::HashMap::entry_async` locks the bucket's slot for the whole
/// refill-and-consume step, so concurrent requests on one key are
/// serialized while different keys proceed in parallel.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    buckets: HashMap<BucketKey, TokenBucket>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets not consumed from for `idle_timeout` that have also
    /// refilled to burst capacity. A dropped bucket comes back full, so
    /// eviction never hands out tokens the bucket had not earned.
    pub async fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let before = self.buckets.len();
        let now = Instant::now();
        self.buckets
            .retain_async(|_, bucket| {
                now.saturating_duration_since(bucket.last_refill()) < idle_timeout
                    || !bucket.is_full_at(now)
            })
            .await;
        before.saturating_sub(self.buckets.len())
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn consume(
        &self,
        key: &BucketKey,
        config: &TokenBucketConfig,
    ) -> Result<Consumption, RateLimitStoreError> {
        let now = Instant::now();
        let mut entry = self
            .buckets
            .entry_async(key.clone())
            .await
            .or_insert_with(|| TokenBucket::full(config, now));
        Ok(entry.get_mut().consume(config, now))
    }

    fn describe(&self) -> String {
        "in_memory".to_string()
    }
}
