use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::Client;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{config::models::RouteDefinitions, ports::route_locator::RouteLocator};

/// Route locator that fetches JSON route definitions from a URL and polls it
/// for changes. A change is detected by hashing the fetched definitions.
pub struct HttpRouteLocator {
    url: String,
    client: Client,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
    poller: JoinHandle<()>,
}

impl HttpRouteLocator {
    /// Starts the polling task; must be called inside a Tokio runtime.
    pub fn new(url: String, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let poller = {
            let client = client.clone();
            let url = url.clone();
            tokio::spawn(async move {
                let mut last_hash: Option<u64> = None;
                let mut interval = tokio::time::interval(poll_interval);

                loop {
                    interval.tick().await;

                    match Self::fetch_definitions(&client, &url).await {
                        Ok(definitions) => {
                            let Some(new_hash) = Self::fingerprint(&definitions) else {
                                continue;
                            };
                            match last_hash {
                                Some(last) if last != new_hash => {
                                    tracing::info!(url = %url, "Remote route definitions changed");
                                    let _ = tx.try_send(());
                                }
                                _ => {}
                            }
                            last_hash = Some(new_hash);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to poll remote routes: {:#}", e);
                        }
                    }
                }
            })
        };

        Self {
            url,
            client,
            update_rx: Mutex::new(Some(rx)),
            poller,
        }
    }

    fn fingerprint(definitions: &RouteDefinitions) -> Option<u64> {
        let json = serde_json::to_string(definitions).ok()?;
        let mut hasher = DefaultHasher::new();
        json.hash(&mut hasher);
        Some(hasher.finish())
    }

    async fn fetch_definitions(client: &Client, url: &str) -> Result<RouteDefinitions> {
        let resp = client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?
            .error_for_status()
            .context("Route source returned an error status")?;
        resp.json::<RouteDefinitions>()
            .await
            .context("Failed to parse JSON route definitions")
    }
}

impl Drop for HttpRouteLocator {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl RouteLocator for HttpRouteLocator {
    async fn route_definitions(&self) -> Result<RouteDefinitions> {
        Self::fetch_definitions(&self.client, &self.url).await
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
