//! The last two steps of every chain: resolving the backend URL and sending
//! the request.
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::{HeaderMap, HeaderName, Request, Uri, header, uri::PathAndQuery};

use crate::{
    core::{
        error::{GatewayError, GatewayResult},
        exchange::Exchange,
        filter::{Chain, Forwarder, GatewayFilter},
    },
    ports::http_client::HttpClient,
};

/// Chain position of [`RouteToRequestUrlFilter`]; route filters with a lower
/// order see the request before the backend URL is fixed.
pub const ROUTE_TO_URL_FILTER_ORDER: i32 = 10_000;

/// Combine the route's scheme and authority with the request's path and
/// query.
pub fn merge_route_uri(route_uri: &Uri, request_uri: &Uri) -> GatewayResult<Uri> {
    let mut parts = http::uri::Parts::default();
    parts.scheme = route_uri.scheme().cloned();
    parts.authority = route_uri.authority().cloned();
    parts.path_and_query = Some(
        request_uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/")),
    );
    Uri::from_parts(parts).map_err(|e| {
        GatewayError::InvalidRequest(format!("cannot build backend url from {route_uri}: {e}"))
    })
}

/// Resolves the absolute backend URL into the `request_url` attribute.
pub struct RouteToRequestUrlFilter;

#[async_trait]
impl GatewayFilter for RouteToRequestUrlFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        let Some(route) = exchange.attributes().route.clone() else {
            return chain.proceed(exchange).await;
        };
        let current = exchange.request().uri.clone();
        let url = merge_route_uri(route.uri(), &current)?;

        let attributes = exchange.attributes_mut();
        if attributes.original_request_urls.last() != Some(&current) {
            attributes.original_request_urls.push(current);
        }
        tracing::trace!(route = route.id(), url = %url, "Resolved backend url");
        attributes.request_url = Some(url);

        chain.proceed(exchange).await
    }

    fn describe(&self) -> String {
        "RouteToRequestUrl".to_string()
    }
}

const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Terminal step: sends the exchange to its resolved backend URL and copies
/// the response back into the exchange.
pub struct HttpForwarder {
    client: Arc<dyn HttpClient>,
}

impl HttpForwarder {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }

    fn target(exchange: &Exchange) -> GatewayResult<Uri> {
        if let Some(url) = &exchange.attributes().request_url {
            return Ok(url.clone());
        }
        match &exchange.attributes().route {
            Some(route) => merge_route_uri(route.uri(), &exchange.request().uri),
            None => Err(GatewayError::FilterContractViolation(format!(
                "exchange {} reached forwarding without a route",
                exchange.id()
            ))),
        }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, exchange: &mut Exchange) -> GatewayResult<()> {
        let url = Self::target(exchange)?;
        let body = match exchange.cached_body() {
            Some(bytes) => Body::from(bytes.clone()),
            None => exchange.take_body().unwrap_or_else(Body::empty),
        };

        let inbound = Arc::clone(exchange.request());
        let mut outbound = Request::new(body);
        *outbound.method_mut() = inbound.method.clone();
        *outbound.uri_mut() = url;
        *outbound.headers_mut() = inbound.headers.clone();
        strip_hop_by_hop(outbound.headers_mut());
        outbound.headers_mut().remove(header::HOST);
        if exchange.cached_body().is_some() {
            outbound.headers_mut().remove(header::CONTENT_LENGTH);
        }

        let response = self.client.send_request(outbound).await?;
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let target = exchange.response_mut();
        target.set_status(parts.status);
        let mut last_name: Option<HeaderName> = None;
        for (name, value) in parts.headers {
            let name = match name {
                Some(name) => {
                    target.headers_mut().remove(&name);
                    last_name = Some(name.clone());
                    name
                }
                None => match &last_name {
                    Some(name) => name.clone(),
                    None => continue,
                },
            };
            target.headers_mut().append(name, value);
        }
        target.set_body(body);
        Ok(())
    }
}
