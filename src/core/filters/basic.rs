//! Stateless request and response transforms.
use async_trait::async_trait;
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::{BodyExt, Limited};
use serde::Deserialize;

use crate::core::{
    error::{GatewayError, GatewayResult},
    exchange::Exchange,
    filter::{Chain, GatewayFilter},
    filters::{StatusSelector, expand_path_template, expand_template, with_path},
};

fn header_name(raw: &str) -> Result<HeaderName, String> {
    HeaderName::try_from(raw).map_err(|e| format!("invalid header name '{raw}': {e}"))
}

fn header_value(exchange: &Exchange, template: &str) -> GatewayResult<HeaderValue> {
    let value = expand_template(template, &exchange.attributes().uri_template_variables);
    HeaderValue::try_from(value.as_str())
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid header value '{value}': {e}")))
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameValueArgs {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameArgs {
    pub name: String,
}

/// Appends a request header. The value may reference template variables.
pub struct AddRequestHeaderFilter {
    name: HeaderName,
    value: String,
}

impl AddRequestHeaderFilter {
    pub fn new(args: &NameValueArgs) -> Result<Self, String> {
        Ok(Self {
            name: header_name(&args.name)?,
            value: args.value.clone(),
        })
    }
}

#[async_trait]
impl GatewayFilter for AddRequestHeaderFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        let value = header_value(exchange, &self.value)?;
        let name = self.name.clone();
        exchange.mutate_request(|request| {
            request.headers.append(name, value);
        });
        chain.proceed(exchange).await
    }

    fn describe(&self) -> String {
        format!("AddRequestHeader: {} = {}", self.name, self.value)
    }
}

pub struct RemoveRequestHeaderFilter {
    name: HeaderName,
}

impl RemoveRequestHeaderFilter {
    pub fn new(args: &NameArgs) -> Result<Self, String> {
        Ok(Self {
            name: header_name(&args.name)?,
        })
    }
}

#[async_trait]
impl GatewayFilter for RemoveRequestHeaderFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        if exchange.request().headers.contains_key(&self.name) {
            exchange.mutate_request(|request| {
                request.headers.remove(&self.name);
            });
        }
        chain.proceed(exchange).await
    }

    fn describe(&self) -> String {
        format!("RemoveRequestHeader: {}", self.name)
    }
}

/// Appends a response header before the rest of the chain runs.
pub struct AddResponseHeaderFilter {
    name: HeaderName,
    value: String,
}

impl AddResponseHeaderFilter {
    pub fn new(args: &NameValueArgs) -> Result<Self, String> {
        Ok(Self {
            name: header_name(&args.name)?,
            value: args.value.clone(),
        })
    }
}

#[async_trait]
impl GatewayFilter for AddResponseHeaderFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        let value = header_value(exchange, &self.value)?;
        exchange
            .response_mut()
            .headers_mut()
            .append(self.name.clone(), value);
        chain.proceed(exchange).await
    }

    fn describe(&self) -> String {
        format!("AddResponseHeader: {} = {}", self.name, self.value)
    }
}

/// Replaces a response header once the rest of the chain has completed.
pub struct SetResponseHeaderFilter {
    name: HeaderName,
    value: String,
}

impl SetResponseHeaderFilter {
    pub fn new(args: &NameValueArgs) -> Result<Self, String> {
        Ok(Self {
            name: header_name(&args.name)?,
            value: args.value.clone(),
        })
    }
}

#[async_trait]
impl GatewayFilter for SetResponseHeaderFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        chain.proceed(exchange).await?;
        let value = header_value(exchange, &self.value)?;
        exchange
            .response_mut()
            .headers_mut()
            .insert(self.name.clone(), value);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("SetResponseHeader: {} = {}", self.name, self.value)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripPrefixArgs {
    pub parts: usize,
}

/// Drops the first `parts` path segments.
pub struct StripPrefixFilter {
    parts: usize,
}

impl StripPrefixFilter {
    pub fn new(args: &StripPrefixArgs) -> Result<Self, String> {
        Ok(Self { parts: args.parts })
    }

    fn strip(&self, path: &str) -> String {
        let rest: Vec<&str> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .skip(self.parts)
            .collect();
        let mut stripped = format!("/{}", rest.join("/"));
        if path.ends_with('/') && stripped.len() > 1 {
            stripped.push('/');
        }
        stripped
    }
}

#[async_trait]
impl GatewayFilter for StripPrefixFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        let path = self.strip(exchange.request().path());
        let uri = with_path(&exchange.request().uri, &path)?;
        exchange.rewrite_uri(uri);
        chain.proceed(exchange).await
    }

    fn describe(&self) -> String {
        format!("StripPrefix: parts={}", self.parts)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrefixPathArgs {
    pub prefix: String,
}

pub struct PrefixPathFilter {
    prefix: String,
}

impl PrefixPathFilter {
    pub fn new(args: &PrefixPathArgs) -> Result<Self, String> {
        if !args.prefix.starts_with('/') {
            return Err(format!("prefix '{}' must start with '/'", args.prefix));
        }
        Ok(Self {
            prefix: args.prefix.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GatewayFilter for PrefixPathFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        let prefix = expand_path_template(&self.prefix, &exchange.attributes().uri_template_variables);
        let path = format!("{prefix}{}", exchange.request().path());
        let uri = with_path(&exchange.request().uri, &path)?;
        exchange.rewrite_uri(uri);
        chain.proceed(exchange).await
    }

    fn describe(&self) -> String {
        format!("PrefixPath: {}", self.prefix)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetPathArgs {
    pub template: String,
}

/// Replaces the path with a template expanded from the matched variables.
pub struct SetPathFilter {
    template: String,
}

impl SetPathFilter {
    pub fn new(args: &SetPathArgs) -> Result<Self, String> {
        if !args.template.starts_with('/') {
            return Err(format!("template '{}' must start with '/'", args.template));
        }
        Ok(Self {
            template: args.template.clone(),
        })
    }
}

#[async_trait]
impl GatewayFilter for SetPathFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        let path = expand_path_template(&self.template, &exchange.attributes().uri_template_variables);
        let uri = with_path(&exchange.request().uri, &path)?;
        exchange.rewrite_uri(uri);
        chain.proceed(exchange).await
    }

    fn describe(&self) -> String {
        format!("SetPath: {}", self.template)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetStatusArgs {
    pub status: StatusSelector,
}

/// Overrides the final response status.
pub struct SetStatusFilter {
    status: StatusCode,
}

impl SetStatusFilter {
    pub fn new(args: &SetStatusArgs) -> Result<Self, String> {
        match args.status {
            StatusSelector::Code(status) => Ok(Self { status }),
            StatusSelector::Series(_) => Err("status must be a single code".to_string()),
        }
    }
}

#[async_trait]
impl GatewayFilter for SetStatusFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        chain.proceed(exchange).await?;
        exchange.response_mut().set_status(self.status);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("SetStatus: {}", self.status.as_u16())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheRequestBodyArgs {
    pub max_bytes: usize,
}

impl Default for CacheRequestBodyArgs {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
        }
    }
}

/// Buffers the request body so later attempts can replay it.
pub struct CacheRequestBodyFilter {
    max_bytes: usize,
}

impl CacheRequestBodyFilter {
    pub fn new(args: &CacheRequestBodyArgs) -> Result<Self, String> {
        if args.max_bytes == 0 {
            return Err("max_bytes must be greater than 0".to_string());
        }
        Ok(Self {
            max_bytes: args.max_bytes,
        })
    }
}

#[async_trait]
impl GatewayFilter for CacheRequestBodyFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        if exchange.cached_body().is_none()
            && let Some(body) = exchange.take_body()
        {
            let collected = Limited::new(body, self.max_bytes)
                .collect()
                .await
                .map_err(|e| GatewayError::InvalidRequest(format!("cannot buffer request body: {e}")))?;
            let bytes = collected.to_bytes();
            tracing::trace!(bytes = bytes.len(), "Cached request body");
            exchange.set_cached_body(bytes);
        }
        chain.proceed(exchange).await
    }

    fn describe(&self) -> String {
        format!("CacheRequestBody: max_bytes={}", self.max_bytes)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackHeadersArgs {
    pub kind_header: String,
    pub message_header: String,
}

impl Default for FallbackHeadersArgs {
    fn default() -> Self {
        Self {
            kind_header: "X-Fallback-Error-Kind".to_string(),
            message_header: "X-Fallback-Error-Message".to_string(),
        }
    }
}

/// Exposes the failure that triggered a circuit-breaker fallback as request
/// headers for the fallback backend.
pub struct FallbackHeadersFilter {
    kind_header: HeaderName,
    message_header: HeaderName,
}

impl FallbackHeadersFilter {
    pub fn new(args: &FallbackHeadersArgs) -> Result<Self, String> {
        Ok(Self {
            kind_header: header_name(&args.kind_header)?,
            message_header: header_name(&args.message_header)?,
        })
    }
}

#[async_trait]
impl GatewayFilter for FallbackHeadersFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        if let Some(error) = exchange.attributes().circuit_breaker_error.clone() {
            let kind = HeaderValue::from_static(error.kind().as_str());
            let message = HeaderValue::try_from(error.to_string()).ok();
            let (kind_header, message_header) =
                (self.kind_header.clone(), self.message_header.clone());
            exchange.mutate_request(|request| {
                request.headers.insert(kind_header, kind);
                if let Some(message) = message {
                    request.headers.insert(message_header, message);
                }
            });
        }
        chain.proceed(exchange).await
    }

    fn describe(&self) -> String {
        format!(
            "FallbackHeaders: {}, {}",
            self.kind_header, self.message_header
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::body::Body;
    use bytes::Bytes;
    use http::{Method, Uri};

    use super::*;
    use crate::core::{
        exchange::GatewayRequest,
        filter::{Dispatch, Forwarder, OrderedFilter},
    };

    /// Records the request it was given and answers 200.
    #[derive(Default)]
    struct Echo {
        seen: Mutex<Option<Arc<GatewayRequest>>>,
        body: Mutex<Option<Bytes>>,
    }

    #[async_trait]
    impl Forwarder for Echo {
        async fn forward(&self, exchange: &mut Exchange) -> GatewayResult<()> {
            *self.seen.lock().unwrap() = Some(exchange.request().clone());
            *self.body.lock().unwrap() = exchange.cached_body().cloned();
            exchange.response_mut().set_status(StatusCode::OK);
            Ok(())
        }
    }

    struct NoDispatch;

    #[async_trait]
    impl Dispatch for NoDispatch {
        async fn dispatch(&self, _exchange: &mut Exchange) -> GatewayResult<()> {
            unreachable!()
        }
    }

    async fn run(filter: impl GatewayFilter + 'static, exchange: &mut Exchange) -> Arc<Echo> {
        let echo = Arc::new(Echo::default());
        let filters = vec![OrderedFilter::new(1, Arc::new(filter))];
        Chain::new(&filters, echo.as_ref(), &NoDispatch)
            .proceed(exchange)
            .await
            .unwrap();
        echo
    }

    fn exchange(uri: &'static str) -> Exchange {
        Exchange::new(GatewayRequest::new(Method::GET, Uri::from_static(uri)), Body::empty())
    }

    #[test]
    fn test_strip_prefix_paths() {
        let filter = StripPrefixFilter::new(&StripPrefixArgs { parts: 2 }).unwrap();
        assert_eq!(filter.strip("/api/v1/users/7"), "/users/7");
        assert_eq!(filter.strip("/api/v1/users/"), "/users/");
        assert_eq!(filter.strip("/api"), "/");
    }

    #[tokio::test]
    async fn test_strip_prefix_records_original_url() {
        let filter = StripPrefixFilter::new(&StripPrefixArgs { parts: 1 }).unwrap();
        let mut exchange = exchange("/service/items?page=2");
        let echo = run(filter, &mut exchange).await;

        let seen = echo.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.uri, "/items?page=2");
        assert_eq!(
            exchange.attributes().original_request_urls,
            vec!["/service/items?page=2"]
        );
    }

    #[tokio::test]
    async fn test_set_path_expands_variables() {
        let filter = SetPathFilter::new(&SetPathArgs {
            template: "/internal/{id}".to_string(),
        })
        .unwrap();
        let mut exchange = exchange("/public/42");
        exchange
            .attributes_mut()
            .uri_template_variables
            .insert("id".to_string(), "42".to_string());
        let echo = run(filter, &mut exchange).await;
        assert_eq!(echo.seen.lock().unwrap().clone().unwrap().uri, "/internal/42");
    }

    #[tokio::test]
    async fn test_prefix_path() {
        let filter = PrefixPathFilter::new(&PrefixPathArgs {
            prefix: "/v2/".to_string(),
        })
        .unwrap();
        let mut exchange = exchange("/orders");
        let echo = run(filter, &mut exchange).await;
        assert_eq!(echo.seen.lock().unwrap().clone().unwrap().uri, "/v2/orders");
    }

    #[tokio::test]
    async fn test_request_header_filters_are_copy_on_write() {
        let mut exchange = exchange("/");
        let before = exchange.request().clone();
        let filter = AddRequestHeaderFilter::new(&NameValueArgs {
            name: "X-Trace".to_string(),
            value: "on".to_string(),
        })
        .unwrap();
        let echo = run(filter, &mut exchange).await;

        assert!(!before.headers.contains_key("x-trace"));
        let seen = echo.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.headers["x-trace"], "on");
    }

    #[tokio::test]
    async fn test_set_response_header_and_status_run_after_forwarding() {
        let mut exchange = exchange("/");
        exchange
            .attributes_mut()
            .uri_template_variables
            .insert("id".to_string(), "7".to_string());
        let header = SetResponseHeaderFilter::new(&NameValueArgs {
            name: "X-Id".to_string(),
            value: "{id}".to_string(),
        })
        .unwrap();
        run(header, &mut exchange).await;
        assert_eq!(exchange.response().headers()["x-id"], "7");

        exchange.attributes_mut().already_routed = false;
        let status = SetStatusFilter::new(&SetStatusArgs {
            status: StatusSelector::Code(StatusCode::IM_A_TEAPOT),
        })
        .unwrap();
        run(status, &mut exchange).await;
        assert_eq!(exchange.response().status(), Some(StatusCode::IM_A_TEAPOT));
    }

    #[tokio::test]
    async fn test_cache_request_body() {
        let mut exchange = Exchange::new(
            GatewayRequest::new(Method::POST, Uri::from_static("/upload")),
            Body::from("payload"),
        );
        let filter = CacheRequestBodyFilter::new(&CacheRequestBodyArgs::default()).unwrap();
        let echo = run(filter, &mut exchange).await;
        assert_eq!(echo.body.lock().unwrap().clone().unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_cache_request_body_limit() {
        let mut exchange = Exchange::new(
            GatewayRequest::new(Method::POST, Uri::from_static("/upload")),
            Body::from("too large"),
        );
        let filter = CacheRequestBodyFilter::new(&CacheRequestBodyArgs { max_bytes: 3 }).unwrap();
        let filters = vec![OrderedFilter::new(1, Arc::new(filter) as Arc<dyn GatewayFilter>)];
        let echo = Echo::default();
        let result = Chain::new(&filters, &echo, &NoDispatch)
            .proceed(&mut exchange)
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_fallback_headers() {
        let mut exchange = exchange("/fallback");
        exchange.attributes_mut().circuit_breaker_error = Some(Arc::new(GatewayError::CircuitOpen {
            name: "svc".to_string(),
        }));
        let filter = FallbackHeadersFilter::new(&FallbackHeadersArgs::default()).unwrap();
        let echo = run(filter, &mut exchange).await;
        let seen = echo.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.headers["x-fallback-error-kind"], "circuit_open");
        assert!(seen.headers.contains_key("x-fallback-error-message"));
    }
}
