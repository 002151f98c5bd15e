//! Configuration data structures for switchyard.
//!
//! These types map directly to YAML (also TOML / JSON) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise.
//! Route, predicate and filter definitions are plain data; `core::registry` turns
//! them into live routes.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Serde adapter for human readable durations such as `"250ms"` or `"5s"`.
pub mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Optional variant of [`humantime_duration`].
pub mod humantime_option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Top level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket address to accept traffic on.
    pub listen_addr: String,
    /// Route definitions, matched in ascending `order`.
    pub routes: Vec<RouteDefinition>,
    /// Filters prepended to every route's own filters.
    pub default_filters: Vec<FilterDefinition>,
    pub http_client: HttpClientConfig,
    pub refresh: RefreshConfig,
    pub rate_limiter: RateLimiterStoreConfig,
    pub management: ManagementConfig,
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            routes: Vec::new(),
            default_filters: Vec::new(),
            http_client: HttpClientConfig::default(),
            refresh: RefreshConfig::default(),
            rate_limiter: RateLimiterStoreConfig::default(),
            management: ManagementConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// A route as supplied by a route source.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RouteDefinition {
    pub id: String,
    pub uri: String,
    #[serde(default)]
    pub order: i32,
    /// AND-ed together; an empty list matches every request.
    #[serde(default)]
    pub predicates: Vec<PredicateDefinition>,
    #[serde(default)]
    pub filters: Vec<FilterDefinition>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Predicate expression.
///
/// ```yaml
/// predicates:
///   - name: path
///     args: { patterns: ["/api/{segment}"] }
///   - any:
///       - { name: method, args: { methods: [GET] } }
///       - not: { name: header, args: { header: X-Internal } }
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum PredicateDefinition {
    All {
        all: Vec<PredicateDefinition>,
    },
    Any {
        any: Vec<PredicateDefinition>,
    },
    Not {
        not: Box<PredicateDefinition>,
    },
    Atom {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FilterDefinition {
    pub name: String,
    /// Free-form arguments; each filter deserializes its own flat struct.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Explicit chain position. Defaults to the 1-based position in the
    /// combined default + route filter list.
    #[serde(default)]
    pub order: Option<i32>,
}

/// Everything a route source yields in one emission.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RouteDefinitions {
    pub routes: Vec<RouteDefinition>,
    pub default_filters: Vec<FilterDefinition>,
}

impl From<&GatewayConfig> for RouteDefinitions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            routes: config.routes.clone(),
            default_filters: config.default_filters.clone(),
        }
    }
}

/// Settings for the outbound HTTP client.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpClientConfig {
    #[serde(with = "humantime_duration")]
    pub connect_timeout: Duration,
    /// Time allowed for the backend to produce response headers.
    #[serde(with = "humantime_option")]
    pub response_timeout: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Route refresh behaviour.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RefreshConfig {
    /// Quiet period after a change notification before routes are rebuilt.
    #[serde(with = "humantime_duration")]
    pub debounce: Duration,
    /// Poll interval for remote (HTTP) route sources.
    #[serde(with = "humantime_duration")]
    pub poll_interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Backing store for token buckets.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimiterStoreConfig {
    InMemory {
        /// Buckets untouched for this long are evicted.
        #[serde(default = "default_idle_timeout", with = "humantime_duration")]
        idle_timeout: Duration,
    },
    Redis {
        url: String,
    },
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(600)
}

impl Default for RateLimiterStoreConfig {
    fn default() -> Self {
        RateLimiterStoreConfig::InMemory {
            idle_timeout: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ManagementConfig {
    pub enabled: bool,
    pub base_path: String,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_path: "/actuator/gateway".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `switchyard=debug,info`.
    pub level: String,
    pub json: bool,
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            include_spans: true,
        }
    }
}
