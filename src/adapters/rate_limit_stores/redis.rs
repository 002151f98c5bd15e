use async_trait::async_trait;
use eyre::{Context, Result};
use redis::{Client, Script, aio::ConnectionManager};

use crate::ports::rate_limit_store::{
    BucketKey, Consumption, RateLimitStore, RateLimitStoreError, TokenBucketConfig,
};

/// Refill-and-consume in one server-side step. Time comes from the Redis
/// server so gateway instances with skewed clocks agree on refills. Both
/// keys expire after twice the time needed to fill an empty bucket.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local tokens_key = KEYS[1]
local timestamp_key = KEYS[2]

local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])

local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

local ttl = math.max(1, math.ceil(capacity / rate * 2))

local last_tokens = tonumber(redis.call('GET', tokens_key))
if last_tokens == nil then
  last_tokens = capacity
end
local last_refreshed = tonumber(redis.call('GET', timestamp_key))
if last_refreshed == nil then
  last_refreshed = now
end

local delta = math.max(0, now - last_refreshed)
local filled = math.min(capacity, last_tokens + delta * rate)
local allowed = 0
local new_tokens = filled
if filled >= requested then
  new_tokens = filled - requested
  allowed = 1
end

redis.call('SETEX', tokens_key, ttl, tostring(new_tokens))
redis.call('SETEX', timestamp_key, ttl, tostring(now))

return { allowed, tostring(new_tokens) }
"#;

/// Token buckets kept in Redis, shared by every gateway instance pointing
/// at the same server.
pub struct RedisRateLimitStore {
    connection: ConnectionManager,
    script: Script,
    url: String,
}

impl RedisRateLimitStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let redacted = redact(url);
        let client =
            Client::open(url).wrap_err_with(|| format!("Invalid Redis url {redacted}"))?;
        let connection = ConnectionManager::new(client)
            .await
            .wrap_err_with(|| format!("Failed to connect to Redis at {redacted}"))?;
        tracing::info!(url = %redacted, "Connected rate limit store to Redis");
        Ok(Self {
            connection,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            url: redacted,
        })
    }

    /// `{...}` is a cluster hash tag: both keys of one bucket share a slot.
    pub fn keys(key: &BucketKey) -> (String, String) {
        let prefix = format!("request_rate_limiter.{{{key}}}");
        (format!("{prefix}.tokens"), format!("{prefix}.timestamp"))
    }
}

/// The connection URL with any password masked.
fn redact(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                // Fails only for URLs that cannot carry credentials.
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn consume(
        &self,
        key: &BucketKey,
        config: &TokenBucketConfig,
    ) -> Result<Consumption, RateLimitStoreError> {
        let (tokens_key, timestamp_key) = Self::keys(key);
        let mut connection = self.connection.clone();
        let (allowed, tokens_left): (i64, String) = self
            .script
            .key(tokens_key)
            .key(timestamp_key)
            .arg(config.replenish_rate)
            .arg(config.burst_capacity)
            .arg(config.requested_tokens)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| RateLimitStoreError::Unavailable(e.to_string()))?;
        let tokens_left = tokens_left.parse::<f64>().map_err(|e| {
            RateLimitStoreError::Protocol(format!("token count '{tokens_left}': {e}"))
        })?;
        Ok(Consumption {
            allowed: allowed == 1,
            tokens_left,
        })
    }

    fn describe(&self) -> String {
        format!("redis({})", self.url)
    }
}
