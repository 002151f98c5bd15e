//! Per-request state threaded through the filter chain.
//!
//! The request is held behind an `Arc` and replaced wholesale by
//! [`Exchange::mutate_request`], so a snapshot taken by one stage never
//! changes underneath it. The response head is owned by the exchange and
//! can be captured and restored by filters that re-run the chain.
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use axum::body::Body;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, Uri, Version, header};
use uuid::Uuid;

use crate::core::{error::GatewayError, route::Route};

/// Immutable view of the inbound request as seen by predicates and filters.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl GatewayRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            remote_addr: None,
        }
    }

    /// Builder-style header append.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Host from the `Host` header, falling back to the URI authority. The
    /// port is stripped.
    pub fn host(&self) -> Option<&str> {
        let raw = self
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.uri.host())?;
        Some(strip_port(raw))
    }

    /// Decoded query parameters in request order.
    pub fn query_params(&self) -> Vec<(String, String)> {
        match self.query() {
            Some(query) => url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Cookies from every `Cookie` header as `(name, value)` pairs.
    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.trim(), value.trim()))
            })
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Status and headers of the response under construction.
#[derive(Debug, Clone, Default)]
pub struct ResponseHead {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
}

#[derive(Default)]
pub struct GatewayResponse {
    head: ResponseHead,
    // Body is !Sync; the mutex lets `&Exchange` cross await points.
    body: Mutex<Option<Body>>,
}

impl GatewayResponse {
    pub fn status(&self) -> Option<StatusCode> {
        self.head.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.head.status = Some(status);
    }

    pub fn clear_status(&mut self) {
        self.head.status = None;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn set_body(&mut self, body: Body) {
        *self.body.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(body);
    }

    pub fn take_body(&mut self) -> Option<Body> {
        self.body
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Restore a previously captured head and drop any body produced since.
    pub fn reset_to(&mut self, head: ResponseHead) {
        self.head = head;
        self.take_body();
    }
}

impl fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Typed attribute bag carried by every exchange.
#[derive(Debug, Default)]
pub struct ExchangeAttributes {
    /// Route selected by the route table.
    pub route: Option<Arc<Route>>,
    /// Values bound by `{name}` placeholders of the matching predicates.
    pub uri_template_variables: HashMap<String, String>,
    /// Zero-based attempt counter maintained by the retry filter.
    pub retry_iteration: Option<u32>,
    /// Failure that sent the exchange to a circuit-breaker fallback.
    pub circuit_breaker_error: Option<Arc<GatewayError>>,
    /// Set by the terminal forwarding step.
    pub already_routed: bool,
    /// Request URIs replaced by rewriting filters, oldest first.
    pub original_request_urls: Vec<Uri>,
    /// Absolute backend URI resolved for the forwarding step.
    pub request_url: Option<Uri>,
    /// Weight group name to chosen route id.
    pub weights: HashMap<String, String>,
    /// Authenticated principal, if an upstream layer resolved one.
    pub principal: Option<String>,
    /// Nesting level of fallback dispatches.
    pub dispatch_depth: u32,
    /// Free-form values for extension filters.
    pub values: HashMap<String, String>,
}

/// State a re-running filter puts back before each new pass over the
/// remainder of the chain.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    request: Arc<GatewayRequest>,
    head: ResponseHead,
    route: Option<Arc<Route>>,
    uri_template_variables: HashMap<String, String>,
    circuit_breaker_error: Option<Arc<GatewayError>>,
    already_routed: bool,
    original_request_urls: usize,
    request_url: Option<Uri>,
    weights: HashMap<String, String>,
    dispatch_depth: u32,
}

pub struct Exchange {
    id: Uuid,
    request: Arc<GatewayRequest>,
    body: Mutex<Option<Body>>,
    cached_body: Option<Bytes>,
    response: GatewayResponse,
    attributes: ExchangeAttributes,
}

impl Exchange {
    pub fn new(request: GatewayRequest, body: Body) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: Arc::new(request),
            body: Mutex::new(Some(body)),
            cached_body: None,
            response: GatewayResponse::default(),
            attributes: ExchangeAttributes::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &Arc<GatewayRequest> {
        &self.request
    }

    /// Copy-on-write update of the request. Earlier snapshots stay intact.
    pub fn mutate_request(&mut self, mutate: impl FnOnce(&mut GatewayRequest)) {
        let mut next = GatewayRequest::clone(&self.request);
        mutate(&mut next);
        self.request = Arc::new(next);
    }

    /// Replace the request URI, remembering the previous one.
    pub fn rewrite_uri(&mut self, uri: Uri) {
        let previous = self.request.uri.clone();
        self.attributes.original_request_urls.push(previous);
        self.mutate_request(|request| request.uri = uri);
    }

    pub fn take_body(&mut self) -> Option<Body> {
        self.body
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn cached_body(&self) -> Option<&Bytes> {
        self.cached_body.as_ref()
    }

    pub fn set_cached_body(&mut self, bytes: Bytes) {
        self.cached_body = Some(bytes);
    }

    pub fn response(&self) -> &GatewayResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut GatewayResponse {
        &mut self.response
    }

    pub fn attributes(&self) -> &ExchangeAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut ExchangeAttributes {
        &mut self.attributes
    }

    /// Capture the request, response head and routing attributes.
    pub fn checkpoint(&self) -> Checkpoint {
        let attributes = &self.attributes;
        Checkpoint {
            request: Arc::clone(&self.request),
            head: self.response.head().clone(),
            route: attributes.route.clone(),
            uri_template_variables: attributes.uri_template_variables.clone(),
            circuit_breaker_error: attributes.circuit_breaker_error.clone(),
            already_routed: attributes.already_routed,
            original_request_urls: attributes.original_request_urls.len(),
            request_url: attributes.request_url.clone(),
            weights: attributes.weights.clone(),
            dispatch_depth: attributes.dispatch_depth,
        }
    }

    /// Undo everything done since `checkpoint` was taken, except the
    /// consumed body and free-form values. The response body is dropped.
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.request = checkpoint.request;
        self.response.reset_to(checkpoint.head);
        let attributes = &mut self.attributes;
        attributes.route = checkpoint.route;
        attributes.uri_template_variables = checkpoint.uri_template_variables;
        attributes.circuit_breaker_error = checkpoint.circuit_breaker_error;
        attributes.already_routed = checkpoint.already_routed;
        attributes
            .original_request_urls
            .truncate(checkpoint.original_request_urls);
        attributes.request_url = checkpoint.request_url;
        attributes.weights = checkpoint.weights;
        attributes.dispatch_depth = checkpoint.dispatch_depth;
    }

    pub fn route_id(&self) -> Option<&str> {
        self.attributes.route.as_deref().map(Route::id)
    }

    /// Finish the exchange. An unset status means `200 OK`.
    pub fn into_response(mut self) -> Response<Body> {
        let body = self.response.take_body().unwrap_or_else(Body::empty);
        let head = self.response.head;
        let mut response = Response::new(body);
        *response.status_mut() = head.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = head.headers;
        response
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("method", &self.request.method)
            .field("uri", &self.request.uri)
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}
