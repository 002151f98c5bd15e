pub mod circuit_breaker;
pub mod error;
pub mod exchange;
pub mod filter;
pub mod filters;
pub mod gateway;
pub mod predicate;
pub mod rate_limiter;
pub mod registry;
pub mod route;
pub mod route_table;

pub use error::{FailureKind, GatewayError, GatewayResult};
pub use exchange::{Exchange, GatewayRequest};
pub use gateway::GatewayHandler;
pub use registry::{Collaborators, Registry};
pub use route::Route;
pub use route_table::{RefreshEvent, RouteSnapshot, RouteTable};
