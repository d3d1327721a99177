//! Hot reload file watcher for plug manifests
//!
//! Watches plug directories for `*.plug.json` changes and loads, reloads
//! or unloads the affected plugs.

use crate::discovery::{is_manifest_path, read_manifest, DiscoveryError, ManifestScanner};
use crate::sandbox::UnitFactory;
use crate::System;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use plugos_api::Manifest;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Configuration for the hot reload watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for file events
    pub debounce: Duration,
    /// Whether to load existing manifests on start
    pub load_existing: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            load_existing: true,
        }
    }
}

/// Manifest path to the manifest it last loaded
///
/// A plug name belongs to at most one path: the one that loaded it last.
type LoadedPaths = Arc<Mutex<HashMap<PathBuf, Manifest>>>;

/// Whether an event may have changed a manifest's content
///
/// Reading a manifest produces access events on it, so those never count.
fn is_content_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_))
}

async fn record_loaded(loaded: &LoadedPaths, path: &Path, manifest: Manifest) {
    let mut loaded = loaded.lock().await;
    loaded.retain(|other, existing| other == path || existing.name != manifest.name);
    loaded.insert(path.to_path_buf(), manifest);
}

/// Hot reload watcher for plug directories
pub struct HotReloadWatcher {
    system: System,
    loaded: LoadedPaths,
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
}

impl HotReloadWatcher {
    /// Create a new hot reload watcher for the given directories
    pub async fn new(
        system: System,
        factory: Arc<dyn UnitFactory>,
        directories: impl IntoIterator<Item = impl AsRef<Path>>,
        config: WatcherConfig,
    ) -> Result<Self, WatcherError> {
        let directories: Vec<PathBuf> = directories
            .into_iter()
            .map(|p| p.as_ref().to_path_buf())
            .collect();
        let loaded: LoadedPaths = Arc::new(Mutex::new(HashMap::new()));

        // Load existing manifests if configured
        if config.load_existing {
            for dir in directories.iter().filter(|dir| dir.is_dir()) {
                Self::load_directory(&system, factory.as_ref(), &loaded, dir).await?;
            }
        }

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = event_tx.blocking_send(event);
            }
        })
        .map_err(WatcherError::WatcherInit)?;

        for dir in &directories {
            if dir.exists() {
                watcher
                    .watch(dir, RecursiveMode::NonRecursive)
                    .map_err(WatcherError::WatcherInit)?;
                tracing::info!(dir = %dir.display(), "Watching directory for plugs");
            } else {
                tracing::warn!(dir = %dir.display(), "Directory does not exist, skipping");
            }
        }

        let task_system = system.clone();
        let task_loaded = loaded.clone();
        let debounce = config.debounce;
        tokio::spawn(async move {
            let mut pending: Vec<PathBuf> = Vec::new();
            let mut debounce_timer: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Hot reload watcher shutting down");
                        break;
                    }

                    Some(event) = event_rx.recv() => {
                        if !is_content_change(&event.kind) {
                            continue;
                        }
                        for path in event.paths {
                            if is_manifest_path(&path) {
                                if !pending.contains(&path) {
                                    pending.push(path);
                                }
                                debounce_timer = Some(tokio::time::Instant::now() + debounce);
                            }
                        }
                    }

                    _ = async {
                        match debounce_timer {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        for path in pending.drain(..) {
                            Self::handle_file_change(&task_system, factory.as_ref(), &task_loaded, &path).await;
                        }
                        debounce_timer = None;
                    }
                }
            }
        });

        Ok(Self {
            system,
            loaded,
            _watcher: watcher,
            shutdown_tx,
        })
    }

    /// Load all manifests from a directory
    async fn load_directory(
        system: &System,
        factory: &dyn UnitFactory,
        loaded: &LoadedPaths,
        dir: &Path,
    ) -> Result<(), WatcherError> {
        let result = ManifestScanner::new().scan_directory(dir)?;

        for (path, e) in &result.failures {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read manifest");
        }

        for found in result.manifests {
            match system.load(found.manifest.clone(), factory).await {
                Ok(_) => {
                    tracing::info!(plug = %found.manifest.name, path = %found.path.display(), "Loaded plug");
                    record_loaded(loaded, &found.path, found.manifest).await;
                }
                Err(e) => {
                    tracing::warn!(path = %found.path.display(), error = %e, "Failed to load plug");
                }
            }
        }

        Ok(())
    }

    /// Handle a file change event
    async fn handle_file_change(system: &System, factory: &dyn UnitFactory, loaded: &LoadedPaths, path: &Path) {
        if !path.exists() {
            // File deleted - unload, unless another path has loaded the plug since
            let owned = loaded.lock().await.remove(path);
            if let Some(manifest) = owned {
                if system.unload(&manifest.name).await.is_ok() {
                    tracing::info!(plug = %manifest.name, path = %path.display(), "Plug unloaded (file deleted)");
                }
            }
            return;
        }

        // File created or modified - load/reload
        let manifest = match read_manifest(path) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read manifest");
                return;
            }
        };

        let name = manifest.name.clone();
        let previous = loaded.lock().await.get(path).cloned();
        if let Some(previous) = previous {
            if previous == manifest && system.plug(&name).is_some() {
                tracing::debug!(plug = %name, path = %path.display(), "Manifest unchanged, skipping reload");
                return;
            }
            if previous.name != name {
                // Manifest renamed its plug
                let _ = system.unload(&previous.name).await;
                loaded.lock().await.remove(path);
            }
        }

        match system.load(manifest.clone(), factory).await {
            Ok(_) => {
                tracing::info!(plug = %name, path = %path.display(), "Plug reloaded");
                record_loaded(loaded, path, manifest).await;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to reload plug");
            }
        }
    }

    /// Get the system plugs are loaded into
    pub fn system(&self) -> &System {
        &self.system
    }

    /// Plug names by manifest path, for plugs loaded by this watcher
    pub async fn loaded_paths(&self) -> HashMap<PathBuf, String> {
        self.loaded
            .lock()
            .await
            .iter()
            .map(|(path, manifest)| (path.clone(), manifest.name.clone()))
            .collect()
    }

    /// Shutdown the watcher
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Errors that can occur during watching
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to initialize watcher: {0}")]
    WatcherInit(#[source] notify::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}
