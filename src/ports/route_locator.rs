use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::RouteDefinitions;

/// Source of route definitions. Every emission is a full replacement of the
/// previous one.
#[async_trait]
pub trait RouteLocator: Send + Sync {
    /// Load the current set of route definitions.
    async fn route_definitions(&self) -> Result<RouteDefinitions>;

    /// Return a channel that signals when the definitions have changed, or
    /// `None` for sources that never change. The receiver can be taken once;
    /// the consumer reacts by calling `route_definitions` again.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;
}
