//! Extension directory watcher.
//!
//! Forwards file events for `*.js` files directly inside the extension
//! directory and reloads or removes the matching package. Events for the same
//! file are coalesced: while a reload for a path is pending, further events
//! only mark it dirty so it runs once more after the current pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::descriptor::is_extension_file;
use crate::loader::{LoadOutcome, Loader};

/// Watches an extension directory and keeps the registry in sync with it.
pub struct ExtensionWatcher {
    dir: PathBuf,
    loader: Loader,
    debounce: Duration,
    rx: mpsc::Receiver<PathBuf>,
    /// Paths with a pending reload, flagged when touched again meanwhile.
    in_flight: Arc<DashMap<PathBuf, bool>>,
    _watcher: RecommendedWatcher,
}

impl ExtensionWatcher {
    pub(crate) fn new(dir: &Path, loader: Loader, debounce: Duration) -> Result<Self, notify::Error> {
        let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        let (tx, rx) = mpsc::channel(100);

        let watched = dir.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                for path in Self::event_paths(&watched, &event) {
                    let _ = tx.blocking_send(path);
                }
            }
            Err(e) => {
                error!("Extension watcher error: {}", e);
            }
        })?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!("Watching extension directory: {}", dir.display());

        Ok(Self {
            dir,
            loader,
            debounce,
            rx,
            in_flight: Arc::new(DashMap::new()),
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Extension files touched by an event.
    fn event_paths(dir: &Path, event: &Event) -> Vec<PathBuf> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
            _ => return Vec::new(),
        }

        event
            .paths
            .iter()
            .filter(|path| path.parent() == Some(dir) && is_extension_file(path))
            .cloned()
            .collect()
    }

    /// Process events until the underlying watcher goes away.
    pub async fn run(mut self) {
        info!("Starting extension watcher loop");

        while let Some(path) = self.rx.recv().await {
            self.schedule(path);
        }

        info!("Extension watcher loop ended");
    }

    fn schedule(&self, path: PathBuf) {
        if let Some(mut dirty) = self.in_flight.get_mut(&path) {
            *dirty = true;
            return;
        }
        self.in_flight.insert(path.clone(), false);

        let loader = self.loader.clone();
        let in_flight = self.in_flight.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(debounce).await;
                if let Some(mut dirty) = in_flight.get_mut(&path) {
                    *dirty = false;
                }

                Self::reload(&loader, &path).await;

                if in_flight.remove_if(&path, |_, dirty| !*dirty).is_some() {
                    break;
                }
                debug!("{} changed during reload, reloading again", path.display());
            }
        });
    }

    async fn reload(loader: &Loader, path: &Path) {
        match loader.load_file(path).await {
            LoadOutcome::Healthy(package) => info!(package = %package, "extension reloaded"),
            LoadOutcome::Unhealthy { package, error } => {
                info!(package = %package, error = %error, "extension reloaded with errors")
            }
            LoadOutcome::Removed(packages) => info!(packages = ?packages, "extension file deleted"),
            LoadOutcome::Ignored => {}
        }
    }
}
