//! Runs the remainder of the chain under a [`CircuitBreaker`], optionally
//! re-dispatching failed exchanges to a fallback path.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use http::Uri;
use serde::Deserialize;

use crate::{
    config::models::{humantime_duration, humantime_option},
    core::{
        circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerSettings},
        error::{GatewayError, GatewayResult},
        exchange::Exchange,
        filter::{Chain, GatewayFilter},
        filters::{StatusSelector, expand_path_template},
    },
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerArgs {
    /// Breaker id; defaults to the route id.
    pub name: Option<String>,
    /// `forward:/path` or `/path`, may reference template variables.
    pub fallback_uri: Option<String>,
    /// Response statuses that count as failures.
    pub status_codes: Vec<StatusSelector>,
    pub resume_without_error: bool,
    pub failure_threshold: u32,
    #[serde(with = "humantime_duration")]
    pub wait_duration_in_open_state: Duration,
    pub permitted_calls_in_half_open_state: u32,
    #[serde(with = "humantime_option")]
    pub timeout: Option<Duration>,
}

impl Default for CircuitBreakerArgs {
    fn default() -> Self {
        let settings = CircuitBreakerSettings::default();
        Self {
            name: None,
            fallback_uri: None,
            status_codes: Vec::new(),
            resume_without_error: false,
            failure_threshold: settings.failure_threshold,
            wait_duration_in_open_state: settings.wait_duration_in_open_state,
            permitted_calls_in_half_open_state: settings.permitted_calls_in_half_open_state,
            timeout: None,
        }
    }
}

impl CircuitBreakerArgs {
    pub fn settings(&self) -> Result<CircuitBreakerSettings, String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.permitted_calls_in_half_open_state == 0 {
            return Err("permitted_calls_in_half_open_state must be at least 1".to_string());
        }
        Ok(CircuitBreakerSettings {
            failure_threshold: self.failure_threshold,
            wait_duration_in_open_state: self.wait_duration_in_open_state,
            permitted_calls_in_half_open_state: self.permitted_calls_in_half_open_state,
        })
    }
}

fn parse_fallback(raw: &str) -> Result<String, String> {
    let path = raw.strip_prefix("forward:").unwrap_or(raw);
    if !path.starts_with('/') {
        return Err(format!(
            "fallback_uri '{raw}' must be a path such as 'forward:/fallback'"
        ));
    }
    Ok(path.to_string())
}

pub struct CircuitBreakerFilter {
    breaker: Arc<CircuitBreaker>,
    fallback: Option<String>,
    status_codes: Vec<StatusSelector>,
    resume_without_error: bool,
    timeout: Option<Duration>,
}

impl CircuitBreakerFilter {
    pub fn new(
        args: &CircuitBreakerArgs,
        route_id: &str,
        registry: &CircuitBreakerRegistry,
    ) -> Result<Self, String> {
        let name = args.name.as_deref().unwrap_or(route_id);
        let breaker = registry.get_or_create(name, args.settings()?);
        let fallback = args.fallback_uri.as_deref().map(parse_fallback).transpose()?;
        Ok(Self {
            breaker,
            fallback,
            status_codes: args.status_codes.clone(),
            resume_without_error: args.resume_without_error,
            timeout: args.timeout,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn run_protected(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, chain.proceed(exchange))
                .await
                .unwrap_or(Err(GatewayError::UpstreamTimeout { timeout })),
            None => chain.proceed(exchange).await,
        };
        outcome?;
        match exchange.response().status() {
            Some(status) if self.status_codes.iter().any(|s| s.matches(status)) => {
                Err(GatewayError::UpstreamStatus { status })
            }
            _ => Ok(()),
        }
    }

    async fn on_failure(
        &self,
        exchange: &mut Exchange,
        chain: Chain<'_>,
        error: GatewayError,
    ) -> GatewayResult<()> {
        let Some(fallback) = &self.fallback else {
            if self.resume_without_error {
                tracing::debug!(breaker = self.breaker.name(), error = %error, "Resuming without error");
                return Ok(());
            }
            return Err(error);
        };

        let path = expand_path_template(fallback, &exchange.attributes().uri_template_variables);
        let path_and_query = match (path.contains('?'), exchange.request().query()) {
            (false, Some(query)) => format!("{path}?{query}"),
            _ => path,
        };
        let uri: Uri = path_and_query
            .parse()
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid fallback '{path_and_query}': {e}")))?;

        tracing::debug!(
            breaker = self.breaker.name(),
            error = %error,
            fallback = %uri,
            "Dispatching to fallback"
        );
        exchange.response_mut().clear_status();
        let attributes = exchange.attributes_mut();
        attributes.already_routed = false;
        attributes.request_url = None;
        attributes.circuit_breaker_error = Some(Arc::new(error));
        exchange.rewrite_uri(uri);
        chain.dispatch(exchange).await
    }
}

#[async_trait]
impl GatewayFilter for CircuitBreakerFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        let Some(permit) = self.breaker.try_acquire() else {
            let error = GatewayError::CircuitOpen {
                name: self.breaker.name().to_string(),
            };
            return self.on_failure(exchange, chain, error).await;
        };

        let entry_head = exchange.response().head().clone();
        match self.run_protected(exchange, chain).await {
            Ok(()) => {
                permit.record_success();
                Ok(())
            }
            Err(error @ GatewayError::FilterContractViolation(_)) => {
                drop(permit);
                Err(error)
            }
            Err(error) => {
                permit.record_failure();
                exchange.response_mut().reset_to(entry_head);
                self.on_failure(exchange, chain, error).await
            }
        }
    }

    fn describe(&self) -> String {
        format!(
            "CircuitBreaker: name={} fallback={}",
            self.breaker.name(),
            self.fallback.as_deref().unwrap_or("none")
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use axum::body::Body;
    use http::{Method, StatusCode};

    use super::*;
    use crate::core::{
        circuit_breaker::CircuitState,
        exchange::GatewayRequest,
        filter::{Dispatch, Forwarder, OrderedFilter},
    };

    struct Failing {
        calls: AtomicU32,
        status: StatusCode,
    }

    #[async_trait]
    impl Forwarder for Failing {
        async fn forward(&self, exchange: &mut Exchange) -> GatewayResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            exchange.response_mut().set_status(self.status);
            Ok(())
        }
    }

    /// Records what the fallback dispatch saw.
    #[derive(Default)]
    struct RecordingDispatch {
        seen: Mutex<Vec<(Uri, Option<String>, bool)>>,
    }

    #[async_trait]
    impl Dispatch for RecordingDispatch {
        async fn dispatch(&self, exchange: &mut Exchange) -> GatewayResult<()> {
            let attributes = exchange.attributes();
            let error = attributes
                .circuit_breaker_error
                .as_ref()
                .map(|e| e.to_string());
            self.seen.lock().unwrap().push((
                exchange.request().uri.clone(),
                error,
                attributes.already_routed,
            ));
            exchange.response_mut().set_status(StatusCode::OK);
            Ok(())
        }
    }

    fn filter(args: CircuitBreakerArgs) -> (Vec<OrderedFilter>, Arc<CircuitBreaker>) {
        let registry = CircuitBreakerRegistry::new();
        let filter = CircuitBreakerFilter::new(&args, "route", &registry).unwrap();
        let breaker = Arc::clone(filter.breaker());
        (vec![OrderedFilter::new(1, Arc::new(filter))], breaker)
    }

    fn exchange(uri: &'static str) -> Exchange {
        Exchange::new(GatewayRequest::new(Method::GET, Uri::from_static(uri)), Body::empty())
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_remainder() {
        let (filters, breaker) = filter(CircuitBreakerArgs {
            status_codes: vec![StatusSelector::Series(5)],
            failure_threshold: 2,
            wait_duration_in_open_state: Duration::from_secs(30),
            ..CircuitBreakerArgs::default()
        });
        let backend = Failing {
            calls: AtomicU32::new(0),
            status: StatusCode::SERVICE_UNAVAILABLE,
        };
        let dispatch = RecordingDispatch::default();

        for _ in 0..2 {
            let mut exchange = exchange("/");
            let result = Chain::new(&filters, &backend, &dispatch).proceed(&mut exchange).await;
            assert!(matches!(result, Err(GatewayError::UpstreamStatus { .. })));
            assert_eq!(exchange.response().status(), None);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        for _ in 0..3 {
            let mut exchange = exchange("/");
            let result = Chain::new(&filters, &backend, &dispatch).proceed(&mut exchange).await;
            assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        let mut exchange = exchange("/");
        let _ = Chain::new(&filters, &backend, &dispatch).proceed(&mut exchange).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_fallback_rewrites_and_dispatches() {
        let (filters, _) = filter(CircuitBreakerArgs {
            fallback_uri: Some("forward:/fallback/{id}".to_string()),
            status_codes: vec![StatusSelector::Code(StatusCode::BAD_GATEWAY)],
            ..CircuitBreakerArgs::default()
        });
        let backend = Failing {
            calls: AtomicU32::new(0),
            status: StatusCode::BAD_GATEWAY,
        };
        let dispatch = RecordingDispatch::default();
        let mut exchange = exchange("/orders/9?verbose=1");
        exchange
            .attributes_mut()
            .uri_template_variables
            .insert("id".to_string(), "9".to_string());

        Chain::new(&filters, &backend, &dispatch)
            .proceed(&mut exchange)
            .await
            .unwrap();

        let seen = dispatch.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (uri, error, already_routed) = &seen[0];
        assert_eq!(uri, "/fallback/9?verbose=1");
        assert!(error.as_deref().unwrap().contains("502"));
        assert!(!already_routed);
        assert_eq!(exchange.response().status(), Some(StatusCode::OK));
        assert_eq!(
            exchange.attributes().original_request_urls.last().unwrap(),
            "/orders/9?verbose=1"
        );
    }

    #[tokio::test]
    async fn test_resume_without_error() {
        let (filters, _) = filter(CircuitBreakerArgs {
            status_codes: vec![StatusSelector::Series(5)],
            resume_without_error: true,
            ..CircuitBreakerArgs::default()
        });
        let backend = Failing {
            calls: AtomicU32::new(0),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut exchange = exchange("/");
        let result = Chain::new(&filters, &backend, &RecordingDispatch::default())
            .proceed(&mut exchange)
            .await;
        assert!(result.is_ok());
        assert_eq!(exchange.response().status(), None);
    }

    struct Slow;

    #[async_trait]
    impl Forwarder for Slow {
        async fn forward(&self, _exchange: &mut Exchange) -> GatewayResult<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported_distinctly() {
        let (filters, _) = filter(CircuitBreakerArgs {
            timeout: Some(Duration::from_secs(1)),
            ..CircuitBreakerArgs::default()
        });
        let mut exchange = exchange("/");
        let result = Chain::new(&filters, &Slow, &RecordingDispatch::default())
            .proceed(&mut exchange)
            .await;
        assert!(matches!(result, Err(GatewayError::UpstreamTimeout { .. })));
    }

    #[test]
    fn test_fallback_must_be_a_path() {
        assert_eq!(parse_fallback("forward:/fb").unwrap(), "/fb");
        assert_eq!(parse_fallback("/fb").unwrap(), "/fb");
        assert!(parse_fallback("http://elsewhere").is_err());
    }
}
