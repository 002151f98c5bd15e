//! Retry with exponential backoff.
//!
//! The filter re-runs the remainder of the chain while the outcome is
//! classified as retryable. The attempt counter lives in the exchange's
//! `retry_iteration` attribute so downstream filters and the backend
//! request can observe it. Between attempts the exchange is restored to the
//! checkpoint taken when the filter was entered, so rewrites made further
//! down the chain apply once per attempt.
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use rand::Rng;
use serde::Deserialize;

use crate::{
    config::models::humantime_duration,
    core::{
        error::{FailureKind, GatewayError, GatewayResult},
        exchange::Exchange,
        filter::{Chain, GatewayFilter},
        filters::StatusSelector,
    },
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryArgs {
    /// Total invocations of the remainder, the first one included.
    pub max_attempts: u32,
    pub methods: Vec<String>,
    pub statuses: Vec<StatusSelector>,
    pub exceptions: Vec<FailureKind>,
    pub backoff: Option<BackoffArgs>,
}

impl Default for RetryArgs {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            methods: vec!["GET".to_string()],
            statuses: vec![StatusSelector::Series(5)],
            exceptions: vec![FailureKind::Timeout, FailureKind::Connect],
            backoff: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffArgs {
    #[serde(with = "humantime_duration")]
    pub first_backoff: Duration,
    #[serde(with = "humantime_duration")]
    pub max_backoff: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for BackoffArgs {
    fn default() -> Self {
        Self {
            first_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
            factor: 2.0,
            jitter: false,
        }
    }
}

impl BackoffArgs {
    /// Delay before the retry that follows failed attempt `iteration`
    /// (zero-based).
    pub fn delay(&self, iteration: u32) -> Duration {
        let exponent = i32::try_from(iteration).unwrap_or(i32::MAX);
        let base = self.first_backoff.as_secs_f64() * self.factor.powi(exponent);
        let mut delay = base.min(self.max_backoff.as_secs_f64());
        if self.jitter {
            delay *= rand::rng().random_range(0.5..1.5);
            delay = delay.min(self.max_backoff.as_secs_f64());
        }
        Duration::from_nanos((delay * 1e9).round() as u64)
    }
}

pub struct RetryFilter {
    max_attempts: u32,
    methods: Vec<Method>,
    statuses: Vec<StatusSelector>,
    exceptions: Vec<FailureKind>,
    backoff: Option<BackoffArgs>,
}

impl RetryFilter {
    pub fn new(args: &RetryArgs) -> Result<Self, String> {
        if args.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        let methods = args
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|e| format!("invalid method '{m}': {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(backoff) = &args.backoff {
            if backoff.factor < 1.0 || !backoff.factor.is_finite() {
                return Err(format!("backoff factor must be >= 1, got {}", backoff.factor));
            }
            if backoff.first_backoff > backoff.max_backoff {
                return Err("first_backoff must not exceed max_backoff".to_string());
            }
        }
        Ok(Self {
            max_attempts: args.max_attempts,
            methods,
            statuses: args.statuses.clone(),
            exceptions: args.exceptions.clone(),
            backoff: args.backoff.clone(),
        })
    }

    fn is_retryable(&self, exchange: &Exchange, outcome: &GatewayResult<()>) -> bool {
        if !self.methods.contains(&exchange.request().method) {
            return false;
        }
        match outcome {
            Ok(()) => exchange
                .response()
                .status()
                .is_some_and(|status| self.statuses.iter().any(|s| s.matches(status))),
            Err(GatewayError::UpstreamStatus { status }) => {
                self.statuses.iter().any(|s| s.matches(*status))
                    || self.exceptions.contains(&FailureKind::Status)
            }
            Err(error) => self.exceptions.contains(&error.kind()),
        }
    }

    /// A consumed body can only be sent again from the cached copy.
    fn can_replay(exchange: &Exchange) -> bool {
        exchange.request().method.is_safe() || exchange.cached_body().is_some()
    }
}

#[async_trait]
impl GatewayFilter for RetryFilter {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
        let checkpoint = exchange.checkpoint();
        let mut iteration = 0u32;
        loop {
            exchange.attributes_mut().retry_iteration = Some(iteration);
            let outcome = chain.proceed(exchange).await;

            if !self.is_retryable(exchange, &outcome) {
                return outcome;
            }
            if iteration + 1 >= self.max_attempts {
                tracing::debug!(attempts = iteration + 1, "Retries exhausted");
                return outcome;
            }
            if !Self::can_replay(exchange) {
                tracing::debug!(
                    method = %exchange.request().method,
                    "Not retrying, request body cannot be replayed"
                );
                return outcome;
            }

            let delay = self.backoff.as_ref().map(|backoff| backoff.delay(iteration));
            tracing::debug!(
                iteration,
                delay = ?delay,
                status = ?exchange.response().status(),
                error = outcome.as_ref().err().map(tracing::field::display),
                "Retrying request"
            );
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            exchange.restore(checkpoint.clone());
            iteration += 1;
        }
    }

    fn describe(&self) -> String {
        let methods: Vec<_> = self.methods.iter().map(Method::as_str).collect();
        let statuses: Vec<_> = self.statuses.iter().map(ToString::to_string).collect();
        let exceptions: Vec<_> = self.exceptions.iter().map(|k| k.as_str()).collect();
        format!(
            "Retry: max_attempts={} methods={methods:?} statuses={statuses:?} exceptions={exceptions:?}",
            self.max_attempts
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use axum::body::Body;
    use bytes::Bytes;
    use http::{StatusCode, Uri};
    use tokio::time::Instant;

    use super::*;
    use crate::{
        core::{
            exchange::GatewayRequest,
            filter::{Dispatch, Forwarder, OrderedFilter},
            filters::basic::{StripPrefixArgs, StripPrefixFilter},
        },
        ports::http_client::HttpClientError,
    };

    /// Fails `failures` times with `failure`, then answers 200.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        failure: fn() -> GatewayResult<StatusCode>,
        iterations: Mutex<Vec<Option<u32>>>,
        paths: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn new(failures: u32, failure: fn() -> GatewayResult<StatusCode>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                failure,
                iterations: Mutex::new(Vec::new()),
                paths: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Forwarder for Flaky {
        async fn forward(&self, exchange: &mut Exchange) -> GatewayResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.iterations
                .lock()
                .unwrap()
                .push(exchange.attributes().retry_iteration);
            self.paths
                .lock()
                .unwrap()
                .push(exchange.request().uri.to_string());
            exchange
                .response_mut()
                .headers_mut()
                .insert("x-attempt", call.into());
            let status = if call < self.failures {
                (self.failure)()?
            } else {
                StatusCode::OK
            };
            exchange.response_mut().set_status(status);
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

    fn bad_gateway() -> GatewayResult<StatusCode> {
        Ok(StatusCode::BAD_GATEWAY)
    }

    fn connect_error() -> GatewayResult<StatusCode> {
        Err(HttpClientError::Connect("refused".into()).into())
    }

    async fn run(
        args: RetryArgs,
        forwarder: &Flaky,
        method: Method,
        body: Option<Bytes>,
    ) -> (Exchange, GatewayResult<()>) {
        let filters = vec![OrderedFilter::new(
            1,
            Arc::new(RetryFilter::new(&args).unwrap()),
        )];
        let mut exchange = Exchange::new(
            GatewayRequest::new(method, Uri::from_static("/resource")),
            Body::empty(),
        );
        if let Some(body) = body {
            exchange.set_cached_body(body);
        }
        let result = Chain::new(&filters, forwarder, &NoDispatch)
            .proceed(&mut exchange)
            .await;
        (exchange, result)
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let forwarder = Flaky::new(2, bad_gateway);
        let (exchange, result) = run(RetryArgs::default(), &forwarder, Method::GET, None).await;

        assert!(result.is_ok());
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(exchange.response().status(), Some(StatusCode::OK));
        assert_eq!(
            *forwarder.iterations.lock().unwrap(),
            vec![Some(0), Some(1), Some(2)]
        );
    }

    #[tokio::test]
    async fn test_exhausted_attempts_surface_last_outcome() {
        let forwarder = Flaky::new(2, bad_gateway);
        let args = RetryArgs {
            max_attempts: 2,
            ..RetryArgs::default()
        };
        let (exchange, result) = run(args, &forwarder, Method::GET, None).await;

        assert!(result.is_ok());
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(exchange.response().status(), Some(StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn test_connect_errors_are_retried() {
        let forwarder = Flaky::new(1, connect_error);
        let (_, result) = run(RetryArgs::default(), &forwarder, Method::GET, None).await;
        assert!(result.is_ok());
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_method_not_configured_is_not_retried() {
        let forwarder = Flaky::new(2, bad_gateway);
        let (_, _) = run(RetryArgs::default(), &forwarder, Method::DELETE, None).await;
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsafe_method_without_cached_body_is_not_retried() {
        let args = RetryArgs {
            methods: vec!["POST".to_string()],
            ..RetryArgs::default()
        };
        let forwarder = Flaky::new(2, bad_gateway);
        run(args.clone(), &forwarder, Method::POST, None).await;
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 1);

        let forwarder = Flaky::new(2, bad_gateway);
        run(args, &forwarder, Method::POST, Some(Bytes::from_static(b"{}"))).await;
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_response_is_reset_between_attempts() {
        let forwarder = Flaky::new(1, bad_gateway);
        let (exchange, _) = run(RetryArgs::default(), &forwarder, Method::GET, None).await;
        let attempts: Vec<_> = exchange
            .response()
            .headers()
            .get_all("x-attempt")
            .iter()
            .collect();
        assert_eq!(attempts, vec!["1"]);
    }

    #[tokio::test]
    async fn test_downstream_rewrites_apply_once_per_attempt() {
        let filters = vec![
            OrderedFilter::new(1, Arc::new(RetryFilter::new(&RetryArgs::default()).unwrap())),
            OrderedFilter::new(
                2,
                Arc::new(StripPrefixFilter::new(&StripPrefixArgs { parts: 1 }).unwrap()),
            ),
        ];
        let mut exchange = Exchange::new(
            GatewayRequest::new(Method::GET, Uri::from_static("/api/svc/items?page=2")),
            Body::empty(),
        );
        let forwarder = Flaky::new(2, bad_gateway);
        let result = Chain::new(&filters, &forwarder, &NoDispatch)
            .proceed(&mut exchange)
            .await;

        assert!(result.is_ok());
        assert_eq!(
            *forwarder.paths.lock().unwrap(),
            vec!["/svc/items?page=2"; 3]
        );
        assert_eq!(
            exchange.attributes().original_request_urls,
            vec!["/api/svc/items?page=2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_between_attempts() {
        let args = RetryArgs {
            backoff: Some(BackoffArgs {
                first_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_millis(150),
                factor: 2.0,
                jitter: false,
            }),
            ..RetryArgs::default()
        };
        let forwarder = Flaky::new(2, bad_gateway);
        let start = Instant::now();
        run(args, &forwarder, Method::GET, None).await;
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(260),
            "elapsed {elapsed:?}"
        );
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let backoff = BackoffArgs {
            first_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            factor: 3.0,
            jitter: false,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(10));
        assert_eq!(backoff.delay(1), Duration::from_millis(30));
        assert_eq!(backoff.delay(2), Duration::from_millis(50));

        let jittered = BackoffArgs {
            jitter: true,
            ..backoff
        };
        for iteration in 0..5 {
            assert!(jittered.delay(iteration) <= Duration::from_millis(50));
        }
    }
}
