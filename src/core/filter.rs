//! Filter contract and the ordered chain executor.
//!
//! A chain is a slice of [`OrderedFilter`]s plus a cursor. Each filter gets
//! the exchange and a [`Chain`] positioned after itself; calling
//! [`Chain::proceed`] runs the remainder, ending in the terminal
//! [`Forwarder`]. Because the remainder is an ordinary future, a filter can
//! act before it, after it, skip it, or run it more than once.
use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::core::{
    error::{GatewayError, GatewayResult},
    exchange::Exchange,
    route::Route,
};

/// A unit of request/response processing.
#[async_trait]
pub trait GatewayFilter: Send + Sync {
    async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()>;

    /// Human readable summary for operational tooling.
    fn describe(&self) -> String;
}

/// Terminal step of every chain: sends the exchange to its backend.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, exchange: &mut Exchange) -> GatewayResult<()>;
}

/// Top-level entry point that a filter can re-enter, e.g. for fallbacks.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, exchange: &mut Exchange) -> GatewayResult<()>;
}

/// A filter with its position in the chain. Lower orders run first on the
/// way in and last on the way out.
#[derive(Clone)]
pub struct OrderedFilter {
    order: i32,
    filter: Arc<dyn GatewayFilter>,
}

impl OrderedFilter {
    pub fn new(order: i32, filter: Arc<dyn GatewayFilter>) -> Self {
        Self { order, filter }
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn filter(&self) -> &Arc<dyn GatewayFilter> {
        &self.filter
    }

    pub fn describe(&self) -> String {
        format!("[{}, order = {}]", self.filter.describe(), self.order)
    }
}

impl fmt::Debug for OrderedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Handle on the remainder of a chain.
#[derive(Clone, Copy)]
pub struct Chain<'a> {
    filters: &'a [OrderedFilter],
    index: usize,
    forwarder: &'a dyn Forwarder,
    dispatcher: &'a dyn Dispatch,
}

impl<'a> Chain<'a> {
    pub fn new(
        filters: &'a [OrderedFilter],
        forwarder: &'a dyn Forwarder,
        dispatcher: &'a dyn Dispatch,
    ) -> Self {
        Self {
            filters,
            index: 0,
            forwarder,
            dispatcher,
        }
    }

    /// Run the next filter, or forward once every filter has run.
    ///
    /// Forwarding an exchange that is already routed is refused with
    /// [`GatewayError::FilterContractViolation`]; a filter that wants to run
    /// the remainder again must clear the flag first.
    pub async fn proceed(self, exchange: &mut Exchange) -> GatewayResult<()> {
        match self.filters.get(self.index) {
            Some(current) => {
                let next = Chain {
                    index: self.index + 1,
                    ..self
                };
                current.filter.filter(exchange, next).await
            }
            None => {
                if exchange.attributes().already_routed {
                    return Err(GatewayError::FilterContractViolation(format!(
                        "exchange {} was forwarded twice in one traversal",
                        exchange.id()
                    )));
                }
                exchange.attributes_mut().already_routed = true;
                self.forwarder.forward(exchange).await
            }
        }
    }

    /// Re-enter the top-level handler with the exchange.
    pub async fn dispatch(self, exchange: &mut Exchange) -> GatewayResult<()> {
        self.dispatcher.dispatch(exchange).await
    }

    /// Number of filters not yet run.
    pub fn remaining(&self) -> usize {
        self.filters.len().saturating_sub(self.index)
    }
}

/// Merges global and route filters and drives the resulting chain.
pub struct FilterChainExecutor {
    global_filters: Vec<OrderedFilter>,
    forwarder: Arc<dyn Forwarder>,
}

impl FilterChainExecutor {
    pub fn new(global_filters: Vec<OrderedFilter>, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            global_filters,
            forwarder,
        }
    }

    pub fn global_filters(&self) -> &[OrderedFilter] {
        &self.global_filters
    }

    /// Global filters first, then route filters, stable-sorted by order.
    pub fn combine(global: &[OrderedFilter], route: &[OrderedFilter]) -> Vec<OrderedFilter> {
        let mut filters = Vec::with_capacity(global.len() + route.len());
        filters.extend_from_slice(global);
        filters.extend_from_slice(route);
        filters.sort_by_key(OrderedFilter::order);
        filters
    }

    pub async fn execute(
        &self,
        route: &Route,
        exchange: &mut Exchange,
        dispatcher: &dyn Dispatch,
    ) -> GatewayResult<()> {
        let filters = Self::combine(&self.global_filters, route.filters());
        tracing::trace!(route = route.id(), filters = ?filters, "Executing filter chain");
        Chain::new(&filters, self.forwarder.as_ref(), dispatcher)
            .proceed(exchange)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::body::Body;
    use http::{Method, StatusCode, Uri};

    use super::*;
    use crate::core::exchange::GatewayRequest;

    struct Marker {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl GatewayFilter for Marker {
        async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
            self.log.lock().unwrap().push(format!("{}-enter", self.name));
            let result = chain.proceed(exchange).await;
            self.log.lock().unwrap().push(format!("{}-exit", self.name));
            result
        }

        fn describe(&self) -> String {
            format!("Marker {}", self.name)
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl GatewayFilter for ShortCircuit {
        async fn filter(&self, exchange: &mut Exchange, _chain: Chain<'_>) -> GatewayResult<()> {
            exchange.response_mut().set_status(StatusCode::FOUND);
            Ok(())
        }

        fn describe(&self) -> String {
            "ShortCircuit".to_string()
        }
    }

    struct Twice;

    #[async_trait]
    impl GatewayFilter for Twice {
        async fn filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> GatewayResult<()> {
            chain.proceed(exchange).await?;
            chain.proceed(exchange).await
        }

        fn describe(&self) -> String {
            "Twice".to_string()
        }
    }

    #[derive(Default)]
    struct Recording {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Forwarder for Recording {
        async fn forward(&self, exchange: &mut Exchange) -> GatewayResult<()> {
            *self.calls.lock().unwrap() += 1;
            exchange.response_mut().set_status(StatusCode::OK);
            Ok(())
        }
    }

    struct NoDispatch;

    #[async_trait]
    impl Dispatch for NoDispatch {
        async fn dispatch(&self, _exchange: &mut Exchange) -> GatewayResult<()> {
            Err(GatewayError::FilterContractViolation("no dispatch".into()))
        }
    }

    fn exchange() -> Exchange {
        Exchange::new(
            GatewayRequest::new(Method::GET, Uri::from_static("/")),
            Body::empty(),
        )
    }

    fn marker(order: i32, name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> OrderedFilter {
        OrderedFilter::new(
            order,
            Arc::new(Marker {
                name,
                log: log.clone(),
            }),
        )
    }

    #[tokio::test]
    async fn test_onion_ordering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let global = vec![marker(3, "3", &log), marker(1, "1", &log)];
        let route = vec![marker(2, "2", &log)];
        let filters = FilterChainExecutor::combine(&global, &route);
        let forwarder = Recording::default();

        let mut exchange = exchange();
        Chain::new(&filters, &forwarder, &NoDispatch)
            .proceed(&mut exchange)
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["1-enter", "2-enter", "3-enter", "3-exit", "2-exit", "1-exit"]
        );
        assert_eq!(*forwarder.calls.lock().unwrap(), 1);
        assert!(exchange.attributes().already_routed);
    }

    #[test]
    fn test_combine_is_stable_global_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let global = vec![marker(5, "global", &log)];
        let route = vec![marker(5, "route", &log), marker(-1, "early", &log)];
        let combined = FilterChainExecutor::combine(&global, &route);
        let names: Vec<_> = combined.iter().map(OrderedFilter::describe).collect();
        assert_eq!(
            names,
            vec![
                "[Marker early, order = -1]",
                "[Marker global, order = 5]",
                "[Marker route, order = 5]"
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_forwarding() {
        let filters = vec![OrderedFilter::new(1, Arc::new(ShortCircuit))];
        let forwarder = Recording::default();
        let mut exchange = exchange();

        Chain::new(&filters, &forwarder, &NoDispatch)
            .proceed(&mut exchange)
            .await
            .unwrap();

        assert_eq!(*forwarder.calls.lock().unwrap(), 0);
        assert_eq!(exchange.response().status(), Some(StatusCode::FOUND));
    }

    #[tokio::test]
    async fn test_second_forward_is_a_contract_violation() {
        let filters = vec![OrderedFilter::new(1, Arc::new(Twice))];
        let forwarder = Recording::default();
        let mut exchange = exchange();

        let result = Chain::new(&filters, &forwarder, &NoDispatch)
            .proceed(&mut exchange)
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::FilterContractViolation(_))
        ));
        assert_eq!(*forwarder.calls.lock().unwrap(), 1);
    }
}
