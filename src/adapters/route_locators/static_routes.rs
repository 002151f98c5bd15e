use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::{config::models::RouteDefinitions, ports::route_locator::RouteLocator};

/// Fixed route definitions, typically the ones embedded in the gateway
/// configuration file.
pub struct StaticRouteLocator {
    definitions: RouteDefinitions,
}

impl StaticRouteLocator {
    pub fn new(definitions: RouteDefinitions) -> Self {
        Self { definitions }
    }
}

#[async_trait]
impl RouteLocator for StaticRouteLocator {
    async fn route_definitions(&self) -> Result<RouteDefinitions> {
        Ok(self.definitions.clone())
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        None
    }
}
