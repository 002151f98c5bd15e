use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tracing::Instrument;

use crate::{
    config::models::HttpClientConfig,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// HTTP client adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Sets the Host header from the target URI
/// * Forces request version to HTTP/1.1
/// * Bounds connection setup and time to response headers
/// * Converts between Hyper body and Axum body types
///
/// Failures are split into connect errors, timeouts and other request
/// errors so the resilience filters can classify them.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    response_timeout: Option<Duration>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new(config: &HttpClientConfig) -> Self {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(config.connect_timeout));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::info!(
            connect_timeout = ?config.connect_timeout,
            response_timeout = ?config.response_timeout,
            "Created backend HTTP client"
        );
        Self {
            client,
            response_timeout: config.response_timeout,
        }
    }

    fn host_header(req: &Request<AxumBody>) -> HttpClientResult<HeaderValue> {
        let Some(host) = req.uri().host() else {
            return Err(HttpClientError::InvalidRequest(format!(
                "outgoing URI has no host: {}",
                req.uri()
            )));
        };
        let value = match req.uri().port_u16() {
            Some(port) => HeaderValue::from_str(&format!("{host}:{port}")),
            None => HeaderValue::from_str(host),
        };
        value.map_err(|e| HttpClientError::InvalidRequest(format!("invalid host '{host}': {e}")))
    }
}

impl Default for HttpClientAdapter {
    fn default() -> Self {
        Self::new(&HttpClientConfig::default())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let backend_identifier = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );

        let span = tracing::info_span!(
            "backend_request",
            backend.url = %backend_identifier,
            http.method = %req.method(),
            http.path = %req.uri().path(),
            http.status_code = tracing::field::Empty,
        );

        let host = Self::host_header(&req)?;
        req.headers_mut().insert(header::HOST, host);

        let (mut parts, axum_body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let outgoing_request = Request::from_parts(parts, axum_body);

        let client = self.client.clone();
        let response_timeout = self.response_timeout;
        async move {
            tracing::debug!(headers = ?outgoing_request.headers(), "Sending request");
            let pending = client.request(outgoing_request);
            let result = match response_timeout {
                Some(limit) => match tokio::time::timeout(limit, pending).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::Span::current().record("http.status_code", 504u16);
                        tracing::warn!(timeout = ?limit, "Backend did not respond in time");
                        return Err(HttpClientError::Timeout(limit));
                    }
                },
                None => pending.await,
            };

            match result {
                Ok(response) => {
                    tracing::Span::current().record("http.status_code", response.status().as_u16());

                    let (mut parts, hyper_body) = response.into_parts();
                    // Axum re-frames the streamed body.
                    parts.headers.remove(header::TRANSFER_ENCODING);
                    Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
                }
                Err(e) => {
                    tracing::Span::current().record("http.status_code", 599u16);
                    tracing::warn!(
                        "Error making request to backend {} ({} {}): {}",
                        backend_identifier,
                        method,
                        uri,
                        e
                    );
                    let message = format!("{method} {uri}: {e}");
                    if e.is_connect() {
                        Err(HttpClientError::Connect(message))
                    } else {
                        Err(HttpClientError::Request(message))
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
