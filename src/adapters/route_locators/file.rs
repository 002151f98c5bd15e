use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_file, models::RouteDefinitions},
    ports::route_locator::RouteLocator,
};

/// Route locator that reads `routes` and `default_filters` from a local file
/// and watches it for changes. Other keys in the file are ignored, so the
/// gateway configuration file itself can be used.
pub struct FileRouteLocator {
    path: PathBuf,
    // Kept alive for as long as the locator lives.
    _watcher: Option<notify::RecommendedWatcher>,
    update_tx: mpsc::Sender<()>,
    // Taken once by `watch()`.
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileRouteLocator {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let mut locator = Self {
            path,
            _watcher: None,
            update_tx: tx,
            update_rx: Mutex::new(Some(rx)),
        };

        locator.init_watcher()?;
        Ok(locator)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid route file path: {}", self.path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&file_name))
                        {
                            tracing::debug!("Route file changed: {:?}", event.kind);
                            // A pending signal already covers this change.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        // Watch the directory: editors often replace the file instead of writing it.
        let watch_dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch route file directory")?;

        self._watcher = Some(watcher);
        Ok(())
    }
}

#[async_trait]
impl RouteLocator for FileRouteLocator {
    async fn route_definitions(&self) -> Result<RouteDefinitions> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_file::<RouteDefinitions>(&path))
            .await
            .wrap_err("Route file loader task failed")?
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::tempdir;
    use tokio::time::{Duration, sleep};

    use super::*;

    fn write_routes(path: &Path, id: &str) -> Result<()> {
        let contents = format!(
            r#"
listen_addr: "127.0.0.1:8080"
routes:
  - id: {id}
    uri: "http://backend:8080"
    predicates:
      - name: path
        args:
          patterns: ["/{id}/**"]
"#
        );
        let mut file = File::create(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    #[tokio::test]
    async fn test_file_route_locator() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("routes.yaml");
        write_routes(&file_path, "first")?;

        let locator = FileRouteLocator::new(&file_path)?;
        let definitions = locator.route_definitions().await?;
        assert_eq!(definitions.routes[0].id, "first");

        let mut rx = locator.watch().expect("watch channel");
        assert!(locator.watch().is_none());

        // Sleep briefly to ensure file system timestamp difference if needed
        sleep(Duration::from_millis(100)).await;
        write_routes(&file_path, "second")?;

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(notification.is_ok(), "Timed out waiting for route file update");
        assert!(notification.unwrap().is_some(), "Channel closed unexpectedly");

        let definitions = locator.route_definitions().await?;
        assert_eq!(definitions.routes[0].id, "second");

        Ok(())
    }
}
