//! Hot reload.
//!
//! Watches every file the loader read (configs, includes, SSL
//! materials). On a relevant filesystem event the controller debounces
//! briefly, loads and compiles a candidate config, then atomically
//! replaces the listener set. A failed load keeps the running config; a
//! failed listener start rolls back to the previous config; a failed
//! rollback is fatal.
//!
//! In-flight requests keep the config they started with — listener
//! state holds its own `Arc` — so a reload never changes a request
//! midway.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rulegate_core::{loader, CliOverrides};

use crate::handler::ReadyConfig;
use crate::server::{self, ListenerHandle};

/// Quiet period after a filesystem event before reloading.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Drives configuration reloads for the lifetime of the process.
pub struct ReloadController {
    current: Arc<ArcSwap<ReadyConfig>>,
    listeners: Arc<Mutex<Vec<ListenerHandle>>>,
    task: JoinHandle<()>,
}

impl ReloadController {
    /// Starts watching the loaded file set and takes ownership of the
    /// running listeners.
    pub fn spawn(
        initial: Arc<ReadyConfig>,
        config_paths: Vec<PathBuf>,
        overrides: CliOverrides,
        handles: Vec<ListenerHandle>,
    ) -> notify::Result<Self> {
        let current = Arc::new(ArcSwap::from(initial.clone()));
        let listeners = Arc::new(Mutex::new(handles));

        let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) if is_relevant(&event.kind) => {
                    let _ = event_tx.send(());
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "config watch error"),
            })?;
        watch_files(&mut watcher, &initial.watched_files);
        info!(files = initial.watched_files.len(), "config watcher started");

        let task = tokio::spawn(reload_loop(
            event_rx,
            watcher,
            current.clone(),
            listeners.clone(),
            config_paths,
            overrides,
        ));

        Ok(Self {
            current,
            listeners,
            task,
        })
    }

    /// The config serving new requests right now.
    pub fn current(&self) -> Arc<ReadyConfig> {
        self.current.load_full()
    }

    /// Stops watching and drains every listener.
    pub async fn shutdown(self) {
        self.task.abort();
        let mut guard = self.listeners.lock().await;
        let handles = std::mem::take(&mut *guard);
        server::stop_listeners(handles).await;
    }
}

/// Create, write, remove, and rename events all trigger a reload.
fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn watch_files(watcher: &mut RecommendedWatcher, paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = watcher.watch(path, RecursiveMode::NonRecursive) {
            warn!(path = %path.display(), error = %err, "failed to watch file");
        }
    }
}

fn unwatch_files(watcher: &mut RecommendedWatcher, paths: &[PathBuf]) {
    for path in paths {
        let _ = watcher.unwatch(Path::new(path));
    }
}

async fn reload_loop(
    mut events: mpsc::UnboundedReceiver<()>,
    mut watcher: RecommendedWatcher,
    current: Arc<ArcSwap<ReadyConfig>>,
    listeners: Arc<Mutex<Vec<ListenerHandle>>>,
    config_paths: Vec<PathBuf>,
    overrides: CliOverrides,
) {
    while events.recv().await.is_some() {
        // Debounce: editors often emit bursts of events per save.
        loop {
            match tokio::time::timeout(DEBOUNCE, events.recv()).await {
                Ok(Some(())) => continue,
                _ => break,
            }
        }

        info!("config change detected; reloading");
        match reload_once(&current, &listeners, &config_paths, &overrides).await {
            Ok(Some(previous_watch)) => {
                let next = current.load_full();
                unwatch_files(&mut watcher, &previous_watch);
                watch_files(&mut watcher, &next.watched_files);
                info!("configuration reloaded");
            }
            Ok(None) => {}
            Err(()) => {
                error!("rollback failed; no listeners running");
                std::process::exit(1);
            }
        }
    }
}

/// Performs one reload attempt.
///
/// Returns `Ok(Some(old_watch_list))` when the new config is serving,
/// `Ok(None)` when the running config was kept (bad candidate, or
/// rollback succeeded), and `Err(())` when rollback failed.
pub async fn reload_once(
    current: &ArcSwap<ReadyConfig>,
    listeners: &Mutex<Vec<ListenerHandle>>,
    config_paths: &[PathBuf],
    overrides: &CliOverrides,
) -> Result<Option<Vec<PathBuf>>, ()> {
    let candidate = match loader::load(config_paths, overrides) {
        Ok(loaded) => match ReadyConfig::prepare(loaded) {
            Ok(ready) => Arc::new(ready),
            Err(err) => {
                error!(error = %err, "reload failed; keeping current config");
                return Ok(None);
            }
        },
        Err(err) => {
            error!(error = %err, "reload failed; keeping current config");
            return Ok(None);
        }
    };

    let mut guard = listeners.lock().await;
    let old_handles = std::mem::take(&mut *guard);
    debug!(listeners = old_handles.len(), "stopping listener set");
    server::stop_listeners(old_handles).await;

    match server::start_listeners(candidate.clone()).await {
        Ok(handles) => {
            *guard = handles;
            let previous = current.swap(candidate);
            Ok(Some(previous.watched_files.clone()))
        }
        Err(err) => {
            error!(error = %err, "new config failed to start; rolling back");
            let previous = current.load_full();
            match server::start_listeners(previous).await {
                Ok(handles) => {
                    *guard = handles;
                    warn!("rolled back to previous configuration");
                    Ok(None)
                }
                Err(err) => {
                    error!(error = %err, "rollback failed");
                    Err(())
                }
            }
        }
    }
}
