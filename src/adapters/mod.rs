pub mod http_client;
pub mod http_handler;
pub mod rate_limit_stores;
pub mod route_locators;

/// Re-export commonly used types from adapters
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use rate_limit_stores::{InMemoryRateLimitStore, RedisRateLimitStore};
pub use route_locators::{FileRouteLocator, HttpRouteLocator, StaticRouteLocator};
