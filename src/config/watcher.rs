//! File watcher for configuration files.
//!
//! Watches the project and user config directories for changes to
//! `config.yaml` and emits reload events through a tokio watch channel.
//! Rapid successive writes are coalesced by the debouncer.

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Event types emitted when configuration files change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChangeEvent {
    /// A config YAML file changed
    ConfigYaml(PathBuf),
    /// Several config files changed in one debounce window
    BatchChange(Vec<PathBuf>),
    /// Watcher encountered an error
    Error(String),
}

impl ConfigChangeEvent {
    /// Returns true if this event requires a config reload.
    pub fn requires_reload(&self) -> bool {
        !matches!(self, ConfigChangeEvent::Error(_))
    }
}

/// Directories to watch and the debounce window.
#[derive(Debug, Clone)]
pub struct WatchPaths {
    pub config_dirs: Vec<PathBuf>,
    pub debounce: Duration,
}

impl WatchPaths {
    pub fn new(config_dirs: Vec<PathBuf>) -> Self {
        Self {
            config_dirs,
            debounce: Duration::from_millis(500),
        }
    }
}

/// Handle to control the config watcher.
pub struct ConfigWatcherHandle {
    /// Receiver for config change events.
    pub events: watch::Receiver<Option<ConfigChangeEvent>>,
    /// Dropping the handle stops the watcher.
    _task_handle: tokio::task::JoinHandle<()>,
}

impl ConfigWatcherHandle {
    /// Wait for the next config change event. Returns `None` once the
    /// watcher has stopped.
    pub async fn wait_for_change(&mut self) -> Option<ConfigChangeEvent> {
        loop {
            if self.events.changed().await.is_err() {
                return None;
            }
            let event = self.events.borrow().clone();
            if event.is_some() {
                return event;
            }
        }
    }
}

/// Start watching `paths.config_dirs`. Directories that do not exist are
/// skipped. Fails if none of them can be watched.
pub fn start_config_watcher(paths: WatchPaths) -> Result<ConfigWatcherHandle, notify::Error> {
    let (event_tx, event_rx) = watch::channel(None);
    let (notify_tx, notify_rx) = mpsc::channel();

    let mut debouncer = new_debouncer(paths.debounce, notify_tx)?;
    let watcher = debouncer.watcher();

    let mut watched = 0;
    for dir in &paths.config_dirs {
        if dir.is_dir() {
            info!("Watching config directory: {}", dir.display());
            watcher.watch(dir, notify::RecursiveMode::NonRecursive)?;
            watched += 1;
        } else {
            debug!("Config directory does not exist, skipping watch: {}", dir.display());
        }
    }
    if watched == 0 {
        return Err(notify::Error::generic("no config directory exists to watch"));
    }

    let task_handle = tokio::task::spawn_blocking(move || {
        // Keep the debouncer alive for the lifetime of the task
        let _debouncer = debouncer;
        process_notify_events(notify_rx, event_tx);
    });

    Ok(ConfigWatcherHandle {
        events: event_rx,
        _task_handle: task_handle,
    })
}

fn process_notify_events(
    rx: mpsc::Receiver<Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>>,
    tx: watch::Sender<Option<ConfigChangeEvent>>,
) {
    loop {
        match rx.recv() {
            Ok(Ok(events)) => {
                let changed: Vec<PathBuf> = events
                    .into_iter()
                    .filter(|e| {
                        matches!(e.kind, DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous)
                    })
                    .map(|e| e.path)
                    .filter(|p| is_config_file(p))
                    .collect();
                let Some(event) = batch(changed) else {
                    continue;
                };
                debug!("Config change detected: {:?}", event);
                if tx.send(Some(event)).is_err() {
                    info!("Config watcher receiver dropped, stopping");
                    return;
                }
            }
            Ok(Err(e)) => {
                error!("File watcher error: {}", e);
                let _ = tx.send(Some(ConfigChangeEvent::Error(e.to_string())));
            }
            Err(_) => {
                warn!("Config watcher channel closed, stopping");
                return;
            }
        }
    }
}

fn batch(mut changed: Vec<PathBuf>) -> Option<ConfigChangeEvent> {
    match changed.len() {
        0 => None,
        1 => changed.pop().map(ConfigChangeEvent::ConfigYaml),
        _ => Some(ConfigChangeEvent::BatchChange(changed)),
    }
}

fn is_config_file(path: &Path) -> bool {
    let extension = path.extension().and_then(|e| e.to_str());
    matches!(extension, Some("yaml") | Some("yml"))
}
