//! Switchyard - an API gateway core.
//!
//! Switchyard matches each inbound request against an ordered table of
//! routes, each carrying a predicate expression, and runs the matched
//! route's filter chain before forwarding to the route's backend. It follows
//! a **hexagonal architecture**: I/O sits behind the traits in [`ports`], the
//! implementations live in [`adapters`], and routing, chain and resilience
//! logic stays in [`core`].
//!
//! # Features
//! - Composable route predicates (path and host templates, method, header,
//!   query, cookie, time windows, remote address, weighted groups) with
//!   `all` / `any` / `not`
//! - Ordered filter chains in which a filter may act before or after the
//!   rest of the chain, short-circuit it, or run it again
//! - Retry with exponential backoff, per-id circuit breakers with fallback
//!   re-dispatch, token bucket rate limiting (in memory or Redis)
//! - Route definitions from the config file, a watched file or a polled URL,
//!   swapped atomically on refresh
//! - Structured tracing via `tracing`, graceful shutdown
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use switchyard::{
//!     GatewayHandler, HttpClientAdapter, RouteTable,
//!     adapters::StaticRouteLocator,
//!     config::models::RouteDefinitions,
//!     core::{Collaborators, Registry},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = switchyard::config::loader::load_config("switchyard.yaml").await?;
//! let registry = Arc::new(Registry::with_defaults(Collaborators::in_memory()));
//! let locator = Arc::new(StaticRouteLocator::new(RouteDefinitions::from(&cfg)));
//! let routes = Arc::new(RouteTable::new(locator, registry));
//! routes.refresh().await?;
//! let client = Arc::new(HttpClientAdapter::new(&cfg.http_client));
//! let gateway = GatewayHandler::new(routes, client);
//! // Wire `gateway` into the provided HttpHandler adapter (see the binary crate)
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Exchange processing fails with [`core::GatewayError`], which maps to an
//! HTTP status and a JSON error body. Loading and startup return
//! `eyre::Result<T>` with context attached through `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Shared mutable maps use `scc::HashMap`; the route table is an `ArcSwap`
//! of immutable snapshots.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler},
    core::{GatewayHandler, RouteTable},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
