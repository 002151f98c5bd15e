//! Top-level request handling.
//!
//! [`GatewayHandler`] resolves weight groups, looks up the route in the
//! current snapshot and drives the route's filter chain. It is also the
//! [`Dispatch`] target that circuit-breaker fallbacks re-enter, so a
//! fallback request is routed and filtered like any other.
use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, response::IntoResponse};
use http::Response;
use tracing::Instrument;

use crate::{
    core::{
        error::{GatewayError, GatewayResult},
        exchange::Exchange,
        filter::{Dispatch, FilterChainExecutor, OrderedFilter},
        filters::forward::{HttpForwarder, ROUTE_TO_URL_FILTER_ORDER, RouteToRequestUrlFilter},
        route_table::RouteTable,
    },
    ports::http_client::HttpClient,
};

/// Fallback re-entries allowed for one exchange.
pub const MAX_DISPATCH_DEPTH: u32 = 8;

pub struct GatewayHandler {
    routes: Arc<RouteTable>,
    executor: FilterChainExecutor,
}

impl GatewayHandler {
    /// Handler forwarding through `client`, with the route-to-request-url
    /// global filter installed.
    pub fn new(routes: Arc<RouteTable>, client: Arc<dyn HttpClient>) -> Self {
        let executor = FilterChainExecutor::new(
            vec![OrderedFilter::new(
                ROUTE_TO_URL_FILTER_ORDER,
                Arc::new(RouteToRequestUrlFilter),
            )],
            Arc::new(HttpForwarder::new(client)),
        );
        Self::with_executor(routes, executor)
    }

    pub fn with_executor(routes: Arc<RouteTable>, executor: FilterChainExecutor) -> Self {
        Self { routes, executor }
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Process one exchange to completion and produce the client response.
    ///
    /// Errors are rendered through [`GatewayError`]'s response mapping;
    /// headers already written to the exchange response are kept unless the
    /// error response sets the same name.
    pub async fn handle(&self, mut exchange: Exchange) -> Response<Body> {
        let span = tracing::info_span!(
            "exchange",
            request_id = %exchange.id(),
            method = %exchange.request().method,
            path = %exchange.request().path(),
            route = tracing::field::Empty,
        );
        async move {
            match self.dispatch(&mut exchange).await {
                Ok(()) => {
                    tracing::debug!(
                        status = ?exchange.response().status(),
                        "Exchange completed"
                    );
                    exchange.into_response()
                }
                Err(error) => {
                    if error.status_code().is_server_error() {
                        tracing::warn!(error = %error, "Exchange failed");
                    } else {
                        tracing::debug!(error = %error, "Exchange rejected");
                    }
                    let mut response = error.into_response();
                    for (name, value) in exchange.response().headers() {
                        if !response.headers().contains_key(name) {
                            response.headers_mut().append(name.clone(), value.clone());
                        }
                    }
                    response
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl Dispatch for GatewayHandler {
    async fn dispatch(&self, exchange: &mut Exchange) -> GatewayResult<()> {
        let depth = exchange.attributes().dispatch_depth;
        if depth > MAX_DISPATCH_DEPTH {
            return Err(GatewayError::FilterContractViolation(format!(
                "exchange {} re-dispatched more than {MAX_DISPATCH_DEPTH} times",
                exchange.id()
            )));
        }
        exchange.attributes_mut().dispatch_depth = depth + 1;

        // Requests in flight keep the snapshot they started with.
        let snapshot = self.routes.snapshot();
        snapshot.weights().assign(exchange, &mut rand::rng());

        let Some((route, variables)) = snapshot.lookup(exchange) else {
            return Err(GatewayError::NoRouteMatched {
                method: exchange.request().method.clone(),
                path: exchange.request().path().to_string(),
            });
        };
        tracing::Span::current().record("route", route.id());
        tracing::debug!(route = route.id(), depth, "Route matched");

        let attributes = exchange.attributes_mut();
        attributes.route = Some(Arc::clone(&route));
        attributes.uri_template_variables = variables;

        let outcome = self.executor.execute(&route, exchange, self).await;
        exchange.attributes_mut().dispatch_depth = depth;
        outcome
    }
}
