//! The route entity and its builder.
use std::{collections::HashMap, fmt, sync::Arc};

use http::Uri;
use serde::Serialize;
use thiserror::Error;

use crate::core::{
    filter::{GatewayFilter, OrderedFilter},
    predicate::PredicateNode,
};

/// Errors raised while turning definitions into routes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RouteBuildError {
    #[error("route '{route}': invalid uri '{uri}': {reason}")]
    InvalidUri {
        route: String,
        uri: String,
        reason: String,
    },

    #[error("route '{route}': unknown predicate '{name}'")]
    UnknownPredicate { route: String, name: String },

    #[error("route '{route}': unknown filter '{name}'")]
    UnknownFilter { route: String, name: String },

    #[error("route '{route}': invalid arguments for '{name}': {reason}")]
    InvalidArgs {
        route: String,
        name: String,
        reason: String,
    },

    #[error("duplicate route id '{0}'")]
    DuplicateId(String),
}

/// A rule mapping a predicate to a backend and an ordered filter list.
/// Immutable once built.
pub struct Route {
    id: String,
    uri: Uri,
    order: i32,
    predicate: PredicateNode,
    filters: Vec<OrderedFilter>,
    metadata: HashMap<String, serde_json::Value>,
}

impl Route {
    pub fn builder(id: impl Into<String>) -> RouteBuilder {
        RouteBuilder {
            id: id.into(),
            uri: None,
            order: 0,
            predicate: None,
            filters: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn predicate(&self) -> &PredicateNode {
        &self.predicate
    }

    pub fn filters(&self) -> &[OrderedFilter] {
        &self.filters
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn describe(&self) -> RouteDescription {
        RouteDescription {
            id: self.id.clone(),
            uri: self.uri.to_string(),
            order: self.order,
            predicate: self.predicate.describe(),
            filters: self.filters.iter().map(OrderedFilter::describe).collect(),
            metadata: self.metadata.clone(),
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("order", &self.order)
            .field("predicate", &self.predicate)
            .field("filters", &self.filters)
            .finish()
    }
}

/// Serializable summary of a route, used by the management endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDescription {
    pub id: String,
    pub uri: String,
    pub order: i32,
    pub predicate: String,
    pub filters: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub struct RouteBuilder {
    id: String,
    uri: Option<String>,
    order: i32,
    predicate: Option<PredicateNode>,
    filters: Vec<OrderedFilter>,
    metadata: HashMap<String, serde_json::Value>,
}

impl RouteBuilder {
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// AND-ed with any predicate set earlier.
    pub fn predicate(mut self, predicate: PredicateNode) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn filter(mut self, order: i32, filter: Arc<dyn GatewayFilter>) -> Self {
        self.filters.push(OrderedFilter::new(order, filter));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Fails unless the URI is absolute with a scheme and an authority.
    /// A route without predicates matches every request.
    pub fn build(self) -> Result<Route, RouteBuildError> {
        let raw = self.uri.unwrap_or_default();
        let invalid = |reason: String| RouteBuildError::InvalidUri {
            route: self.id.clone(),
            uri: raw.clone(),
            reason,
        };
        let uri: Uri = raw.parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(invalid("scheme and host are required".to_string()));
        }

        Ok(Route {
            id: self.id,
            uri,
            order: self.order,
            predicate: self.predicate.unwrap_or_else(PredicateNode::always),
            filters: self.filters,
            metadata: self.metadata,
        })
    }
}
