//! Name-to-constructor tables for predicates and filters.
//!
//! Route definitions refer to predicates and filters by name with free-form
//! arguments. Each factory deserializes the arguments into its own flat
//! struct and builds the unit. Custom units are registered the same way as
//! the built-in ones, before the route table is built.
use std::{collections::HashMap, sync::Arc};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    adapters::rate_limit_stores::InMemoryRateLimitStore,
    config::models::{FilterDefinition, PredicateDefinition, RouteDefinition, RouteDefinitions},
    core::{
        circuit_breaker::CircuitBreakerRegistry,
        filter::GatewayFilter,
        filters::{
            basic::{
                AddRequestHeaderFilter, AddResponseHeaderFilter, CacheRequestBodyFilter,
                FallbackHeadersFilter, PrefixPathFilter, RemoveRequestHeaderFilter,
                SetPathFilter, SetResponseHeaderFilter, SetStatusFilter, StripPrefixFilter,
            },
            circuit_breaker::CircuitBreakerFilter,
            rate_limit::RequestRateLimiterFilter,
            retry::RetryFilter,
        },
        predicate::{
            PredicateNode,
            atoms::{
                CookiePredicate, HeaderPredicate, HostPredicate, InstantArgs, MethodPredicate,
                PathPredicate, QueryPredicate, RemoteAddrPredicate, TimePredicate, WeightArgs,
                WeightPredicate,
            },
            weight::WeightTable,
        },
        route::{Route, RouteBuildError},
        route_table::RouteSnapshot,
    },
    ports::rate_limit_store::RateLimitStore,
};

/// Shared services handed to factories.
#[derive(Clone)]
pub struct Collaborators {
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    pub rate_limit_store: Arc<dyn RateLimitStore>,
}

impl Collaborators {
    pub fn new(rate_limit_store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            circuit_breakers: Arc::new(CircuitBreakerRegistry::new()),
            rate_limit_store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRateLimitStore::new()))
    }
}

/// State available while one route is being built.
pub struct BuildContext<'a> {
    pub route_id: &'a str,
    pub weights: &'a mut WeightTable,
    pub collaborators: &'a Collaborators,
}

pub type PredicateFactory =
    Arc<dyn Fn(&Value, &mut BuildContext<'_>) -> Result<PredicateNode, String> + Send + Sync>;
pub type FilterFactory = Arc<
    dyn Fn(&Value, &mut BuildContext<'_>) -> Result<Arc<dyn GatewayFilter>, String> + Send + Sync,
>;

/// Deserialize factory arguments. Missing arguments read as `{}`.
pub fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, String> {
    let args = match args {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(args).map_err(|e| e.to_string())
}

pub struct Registry {
    predicates: HashMap<String, PredicateFactory>,
    filters: HashMap<String, FilterFactory>,
    collaborators: Collaborators,
}

impl Registry {
    /// A registry without any units.
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            predicates: HashMap::new(),
            filters: HashMap::new(),
            collaborators,
        }
    }

    /// A registry with every built-in predicate and filter.
    pub fn with_defaults(collaborators: Collaborators) -> Self {
        let mut registry = Self::new(collaborators);
        registry.register_default_predicates();
        registry.register_default_filters();
        registry
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn register_predicate<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value, &mut BuildContext<'_>) -> Result<PredicateNode, String> + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(factory));
    }

    pub fn register_filter<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value, &mut BuildContext<'_>) -> Result<Arc<dyn GatewayFilter>, String>
            + Send
            + Sync
            + 'static,
    {
        self.filters.insert(name.into(), Arc::new(factory));
    }

    pub fn has_predicate(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    fn register_default_predicates(&mut self) {
        fn atom<T, P, C>(construct: C) -> impl Fn(&Value, &mut BuildContext<'_>) -> Result<PredicateNode, String>
        where
            T: DeserializeOwned,
            P: crate::core::predicate::RoutePredicate + 'static,
            C: Fn(&T) -> Result<P, String>,
        {
            move |args, _ctx| Ok(PredicateNode::atom(construct(&parse_args::<T>(args)?)?))
        }

        self.register_predicate("path", atom(PathPredicate::new));
        self.register_predicate("host", atom(HostPredicate::new));
        self.register_predicate("method", atom(MethodPredicate::new));
        self.register_predicate("header", atom(HeaderPredicate::new));
        self.register_predicate("query", atom(QueryPredicate::new));
        self.register_predicate("cookie", atom(CookiePredicate::new));
        self.register_predicate(
            "after",
            atom(|args: &InstantArgs| Ok(TimePredicate::After(args.datetime))),
        );
        self.register_predicate(
            "before",
            atom(|args: &InstantArgs| Ok(TimePredicate::Before(args.datetime))),
        );
        self.register_predicate("between", atom(TimePredicate::between));
        self.register_predicate("remote_addr", atom(RemoteAddrPredicate::new));
        self.register_predicate("x_forwarded_remote_addr", atom(RemoteAddrPredicate::forwarded));
        self.register_predicate("weight", |args, ctx| {
            let args: WeightArgs = parse_args(args)?;
            if args.group.is_empty() {
                return Err("weight group must not be empty".to_string());
            }
            ctx.weights.insert(&args.group, ctx.route_id, args.weight);
            Ok(PredicateNode::atom(WeightPredicate::new(args.group, ctx.route_id)))
        });
    }

    fn register_default_filters(&mut self) {
        fn stateless<T, F, C>(construct: C) -> impl Fn(&Value, &mut BuildContext<'_>) -> Result<Arc<dyn GatewayFilter>, String>
        where
            T: DeserializeOwned,
            F: GatewayFilter + 'static,
            C: Fn(&T) -> Result<F, String>,
        {
            move |args, _ctx| {
                let filter: Arc<dyn GatewayFilter> = Arc::new(construct(&parse_args::<T>(args)?)?);
                Ok(filter)
            }
        }

        self.register_filter("add_request_header", stateless(AddRequestHeaderFilter::new));
        self.register_filter("remove_request_header", stateless(RemoveRequestHeaderFilter::new));
        self.register_filter("add_response_header", stateless(AddResponseHeaderFilter::new));
        self.register_filter("set_response_header", stateless(SetResponseHeaderFilter::new));
        self.register_filter("strip_prefix", stateless(StripPrefixFilter::new));
        self.register_filter("prefix_path", stateless(PrefixPathFilter::new));
        self.register_filter("set_path", stateless(SetPathFilter::new));
        self.register_filter("set_status", stateless(SetStatusFilter::new));
        self.register_filter("cache_request_body", stateless(CacheRequestBodyFilter::new));
        self.register_filter("fallback_headers", stateless(FallbackHeadersFilter::new));
        self.register_filter("retry", stateless(RetryFilter::new));
        self.register_filter("circuit_breaker", |args, ctx| {
            let filter = CircuitBreakerFilter::new(
                &parse_args(args)?,
                ctx.route_id,
                &ctx.collaborators.circuit_breakers,
            )?;
            Ok(Arc::new(filter) as Arc<dyn GatewayFilter>)
        });
        self.register_filter("request_rate_limiter", |args, ctx| {
            let filter = RequestRateLimiterFilter::from_args(
                &parse_args(args)?,
                &ctx.collaborators.rate_limit_store,
            )?;
            Ok(Arc::new(filter) as Arc<dyn GatewayFilter>)
        });
    }

    /// Build every route. Fails on the first invalid route or on a
    /// duplicate id; nothing is partially applied.
    pub fn build_snapshot(
        &self,
        definitions: &RouteDefinitions,
    ) -> Result<RouteSnapshot, RouteBuildError> {
        let mut seen = std::collections::HashSet::new();
        let mut weights = WeightTable::default();
        let mut routes = Vec::with_capacity(definitions.routes.len());
        for definition in &definitions.routes {
            if !seen.insert(definition.id.as_str()) {
                return Err(RouteBuildError::DuplicateId(definition.id.clone()));
            }
            routes.push(self.build_route(definition, &definitions.default_filters, &mut weights)?);
        }
        Ok(RouteSnapshot::new(routes, weights))
    }

    /// Default filters come first. A filter without an explicit order gets
    /// its 1-based position in the combined list.
    pub fn build_route(
        &self,
        definition: &RouteDefinition,
        default_filters: &[FilterDefinition],
        weights: &mut WeightTable,
    ) -> Result<Route, RouteBuildError> {
        let mut ctx = BuildContext {
            route_id: &definition.id,
            weights,
            collaborators: &self.collaborators,
        };

        let mut builder = Route::builder(&definition.id)
            .uri(&definition.uri)
            .order(definition.order);
        for (key, value) in &definition.metadata {
            builder = builder.metadata(key.clone(), value.clone());
        }
        for predicate in &definition.predicates {
            builder = builder.predicate(self.build_predicate(predicate, &mut ctx)?);
        }
        for (index, filter) in default_filters.iter().chain(&definition.filters).enumerate() {
            let factory = self.filters.get(&filter.name).ok_or_else(|| {
                RouteBuildError::UnknownFilter {
                    route: definition.id.clone(),
                    name: filter.name.clone(),
                }
            })?;
            let built = factory(&filter.args, &mut ctx).map_err(|reason| {
                RouteBuildError::InvalidArgs {
                    route: definition.id.clone(),
                    name: filter.name.clone(),
                    reason,
                }
            })?;
            let order = filter
                .order
                .unwrap_or_else(|| i32::try_from(index + 1).unwrap_or(i32::MAX));
            builder = builder.filter(order, built);
        }
        builder.build()
    }

    fn build_predicate(
        &self,
        definition: &PredicateDefinition,
        ctx: &mut BuildContext<'_>,
    ) -> Result<PredicateNode, RouteBuildError> {
        match definition {
            PredicateDefinition::All { all } => {
                let mut node: Option<PredicateNode> = None;
                for part in all {
                    let part = self.build_predicate(part, ctx)?;
                    node = Some(match node {
                        Some(node) => node.and(part),
                        None => part,
                    });
                }
                Ok(node.unwrap_or_else(PredicateNode::always))
            }
            PredicateDefinition::Any { any } => {
                let mut node: Option<PredicateNode> = None;
                for part in any {
                    let part = self.build_predicate(part, ctx)?;
                    node = Some(match node {
                        Some(node) => node.or(part),
                        None => part,
                    });
                }
                Ok(node.unwrap_or_else(|| PredicateNode::always().negate()))
            }
            PredicateDefinition::Not { not } => Ok(self.build_predicate(not, ctx)?.negate()),
            PredicateDefinition::Atom { name, args } => {
                let factory = self.predicates.get(name).ok_or_else(|| {
                    RouteBuildError::UnknownPredicate {
                        route: ctx.route_id.to_string(),
                        name: name.clone(),
                    }
                })?;
                factory(args, ctx).map_err(|reason| RouteBuildError::InvalidArgs {
                    route: ctx.route_id.to_string(),
                    name: name.clone(),
                    reason,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn definitions(value: Value) -> RouteDefinitions {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_builds_routes_with_filter_orders() {
        let registry = Registry::with_defaults(Collaborators::in_memory());
        let snapshot = registry
            .build_snapshot(&definitions(json!({
                "default_filters": [
                    { "name": "add_response_header", "args": { "name": "X-Gateway", "value": "switchyard" } }
                ],
                "routes": [{
                    "id": "orders",
                    "uri": "http://orders:8080",
                    "predicates": [
                        { "name": "path", "args": { "patterns": ["/orders/**"] } },
                        { "not": { "name": "method", "args": { "methods": ["DELETE"] } } }
                    ],
                    "filters": [
                        { "name": "strip_prefix", "args": { "parts": 1 } },
                        { "name": "retry", "order": -5 }
                    ]
                }]
            })))
            .unwrap();

        let route = snapshot.find("orders").unwrap();
        let orders: Vec<i32> = route.filters().iter().map(|f| f.order()).collect();
        assert_eq!(orders, vec![1, 2, -5]);
        assert_eq!(
            route.predicate().describe(),
            r#"(Paths: ["/orders/**"] && !Methods: ["DELETE"])"#
        );
    }

    #[test]
    fn test_unknown_names_and_bad_args_are_reported() {
        let registry = Registry::with_defaults(Collaborators::in_memory());
        let unknown = registry.build_snapshot(&definitions(json!({
            "routes": [{ "id": "a", "uri": "http://a", "predicates": [{ "name": "nope" }] }]
        })));
        assert!(matches!(unknown, Err(RouteBuildError::UnknownPredicate { .. })));

        let bad = registry.build_snapshot(&definitions(json!({
            "routes": [{ "id": "a", "uri": "http://a", "filters": [{ "name": "strip_prefix", "args": { "parts": "x" } }] }]
        })));
        assert!(matches!(bad, Err(RouteBuildError::InvalidArgs { .. })));

        let duplicate = registry.build_snapshot(&definitions(json!({
            "routes": [{ "id": "a", "uri": "http://a" }, { "id": "a", "uri": "http://b" }]
        })));
        assert!(matches!(duplicate, Err(RouteBuildError::DuplicateId(_))));
    }

    #[test]
    fn test_weight_predicates_fill_weight_table() {
        let registry = Registry::with_defaults(Collaborators::in_memory());
        let snapshot = registry
            .build_snapshot(&definitions(json!({
                "routes": [
                    { "id": "v1", "uri": "http://v1", "predicates": [{ "name": "weight", "args": { "group": "svc", "weight": 9 } }] },
                    { "id": "v2", "uri": "http://v2", "predicates": [{ "name": "weight", "args": { "group": "svc", "weight": 1 } }] }
                ]
            })))
            .unwrap();
        assert_eq!(snapshot.weights().choose("svc", 0.5), Some("v1"));
        assert_eq!(snapshot.weights().choose("svc", 0.95), Some("v2"));
    }

    #[test]
    fn test_custom_units_can_be_registered() {
        let mut registry = Registry::new(Collaborators::in_memory());
        registry.register_predicate("always", |_args, _ctx| Ok(PredicateNode::always()));
        assert!(registry.has_predicate("always"));
        assert!(!registry.has_filter("retry"));

        let snapshot = registry
            .build_snapshot(&definitions(json!({
                "routes": [{ "id": "a", "uri": "http://a", "predicates": [{ "name": "always" }] }]
            })))
            .unwrap();
        assert_eq!(snapshot.routes().len(), 1);
    }
}
