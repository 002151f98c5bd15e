//! Route sources feeding the route table.
pub mod file;
pub mod http;
pub mod static_routes;

pub use self::{file::FileRouteLocator, http::HttpRouteLocator, static_routes::StaticRouteLocator};
