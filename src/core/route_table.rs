//! The live set of routes.
//!
//! Routes are held in an immutable [`RouteSnapshot`] behind an `ArcSwap`.
//! A refresh builds a complete new snapshot from the route locator and
//! swaps it in; requests that already loaded the old snapshot finish on it.
//! A failed refresh leaves the previous snapshot live.
use std::{collections::HashMap, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    core::{exchange::Exchange, predicate::weight::WeightTable, registry::Registry, route::Route},
    ports::route_locator::RouteLocator,
};

/// Routes in match order plus the weight groups they declared.
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    routes: Vec<Arc<Route>>,
    weights: WeightTable,
}

impl RouteSnapshot {
    /// Routes are stable-sorted by `order`; equal orders keep their
    /// definition order.
    pub fn new(routes: Vec<Route>, weights: WeightTable) -> Self {
        let mut routes: Vec<Arc<Route>> = routes.into_iter().map(Arc::new).collect();
        routes.sort_by_key(|route| route.order());
        Self { routes, weights }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    pub fn find(&self, id: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|route| route.id() == id)
    }

    /// First route, in order, whose predicate accepts the exchange, with
    /// the template variables its predicate bound.
    pub fn lookup(&self, exchange: &Exchange) -> Option<(Arc<Route>, HashMap<String, String>)> {
        self.routes.iter().find_map(|route| {
            let mut variables = HashMap::new();
            route
                .predicate()
                .evaluate(exchange, &mut variables)
                .then(|| (Arc::clone(route), variables))
        })
    }
}

/// Published on the table's broadcast channel after every refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
    Refreshed { routes: usize },
    Failed { reason: String },
}

struct RouteSource {
    locator: Arc<dyn RouteLocator>,
    registry: Arc<Registry>,
}

pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
    source: Option<RouteSource>,
    events: broadcast::Sender<RefreshEvent>,
    refresh_lock: Mutex<()>,
}

impl RouteTable {
    /// An empty table fed by `locator`. Call [`RouteTable::refresh`] to load
    /// the first snapshot.
    pub fn new(locator: Arc<dyn RouteLocator>, registry: Arc<Registry>) -> Self {
        Self::with_source(
            RouteSnapshot::empty(),
            Some(RouteSource { locator, registry }),
        )
    }

    /// A fixed table without a route source.
    pub fn from_snapshot(snapshot: RouteSnapshot) -> Self {
        Self::with_source(snapshot, None)
    }

    pub fn from_routes(routes: Vec<Route>) -> Self {
        Self::from_snapshot(RouteSnapshot::new(routes, WeightTable::default()))
    }

    fn with_source(snapshot: RouteSnapshot, source: Option<RouteSource>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            source,
            events,
            refresh_lock: Mutex::new(()),
        }
    }

    /// The snapshot current at the time of the call.
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.snapshot.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events.subscribe()
    }

    /// Swap in a new snapshot.
    pub fn replace(&self, snapshot: RouteSnapshot) {
        let routes = snapshot.routes().len();
        self.snapshot.store(Arc::new(snapshot));
        // No subscribers is fine.
        let _ = self.events.send(RefreshEvent::Refreshed { routes });
    }

    /// Reload definitions from the locator and swap in the rebuilt
    /// snapshot. Returns the number of live routes.
    pub async fn refresh(&self) -> eyre::Result<usize> {
        let Some(source) = &self.source else {
            return Ok(self.snapshot().routes().len());
        };
        let _guard = self.refresh_lock.lock().await;

        let built = async {
            let definitions = source.locator.route_definitions().await?;
            let snapshot = source.registry.build_snapshot(&definitions)?;
            Ok::<_, eyre::Report>(snapshot)
        }
        .await;

        match built {
            Ok(snapshot) => {
                let routes = snapshot.routes().len();
                self.replace(snapshot);
                tracing::info!(routes, "Route table refreshed");
                Ok(routes)
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Route refresh failed, keeping previous routes");
                let _ = self.events.send(RefreshEvent::Failed {
                    reason: format!("{e:#}"),
                });
                Err(e)
            }
        }
    }

    /// Refresh whenever the locator signals a change. Bursts of signals are
    /// coalesced: the refresh runs once no new signal arrived for
    /// `debounce`. Returns `None` when the locator never changes.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        debounce: Duration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let mut changes = self.source.as_ref()?.locator.watch()?;
        let table = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = changes.recv() => {
                        if signal.is_none() {
                            break;
                        }
                    }
                }

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(debounce) => break,
                        signal = changes.recv() => {
                            if signal.is_none() {
                                break;
                            }
                        }
                    }
                }

                tracing::info!("Route definitions changed, refreshing");
                // Failures are logged and published by refresh.
                let _ = table.refresh().await;
            }
            tracing::debug!("Route watcher stopped");
        }))
    }
}
