//! Ports: the traits the core uses to reach the outside world.
pub mod http_client;
pub mod rate_limit_store;
pub mod route_locator;
