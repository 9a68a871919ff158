//! Configuration file watcher for hot-reloading routing rules.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher, event::ModifyKind};
use tracing::{debug, error, info, warn};

use crate::rules::RuleStore;

/// Quiet period after the last file event before a reload is triggered.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Message sent when the configuration file changes.
#[derive(Debug)]
pub enum ConfigEvent {
    /// Configuration file was written, created or renamed into place.
    Modified,
    /// Watcher encountered an error.
    Error(String),
}

/// Watches a single configuration file for changes.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    receiver: Receiver<ConfigEvent>,
}

impl ConfigWatcher {
    /// Creates a watcher for `config_path`.
    ///
    /// The parent directory is watched rather than the file, since editors
    /// that save by rename would otherwise detach the watch.
    pub fn new(config_path: &Path) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::channel();

        let config_file = config_path
            .canonicalize()
            .unwrap_or_else(|_| config_path.to_path_buf());
        let file_name = config_file.file_name().map(PathBuf::from);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let Some(expected) = file_name.as_deref() else {
                        return;
                    };
                    if !event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(Path::new) == Some(expected))
                    {
                        return;
                    }

                    let should_reload = matches!(
                        event.kind,
                        notify::EventKind::Modify(ModifyKind::Data(_))
                            | notify::EventKind::Modify(ModifyKind::Any)
                            | notify::EventKind::Modify(ModifyKind::Name(_))
                            | notify::EventKind::Create(_)
                    );

                    if should_reload {
                        debug!("config file changed: {:?} ({:?})", event.paths, event.kind);
                        let _ = tx.send(ConfigEvent::Modified);
                    }
                }
                Err(e) => {
                    error!("file watcher error: {}", e);
                    let _ = tx.send(ConfigEvent::Error(e.to_string()));
                }
            }
        })?;

        let watch_dir = match config_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        info!(
            "watching configuration file: {} (in {})",
            config_file.display(),
            watch_dir.display()
        );

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
        })
    }

    /// Waits up to `timeout` for the next raw event.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ConfigEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Discards events that are already queued.
    fn drain(&self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// Starts a thread that collapses bursts of file events into single
/// [`ConfigEvent::Modified`] notifications.
pub fn spawn_config_watcher(
    config_path: &Path,
    debounce: Duration,
) -> Result<Receiver<ConfigEvent>, notify::Error> {
    let (tx, rx) = mpsc::channel();
    let watcher = ConfigWatcher::new(config_path)?;

    thread::Builder::new()
        .name("config-watcher".to_string())
        .spawn(move || {
            let mut pending = false;
            loop {
                match watcher.recv_timeout(Duration::from_millis(100)) {
                    Ok(ConfigEvent::Modified) => pending = true,
                    Ok(ConfigEvent::Error(e)) => warn!("config watcher error: {}", e),
                    Err(RecvTimeoutError::Timeout) if pending => {
                        // Editors often write in several steps.
                        thread::sleep(debounce);
                        watcher.drain();

                        debug!("sending config reload notification");
                        if tx.send(ConfigEvent::Modified).is_err() {
                            break;
                        }
                        pending = false;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .map_err(notify::Error::io)?;

    Ok(rx)
}

/// Applies every debounced change of `config_path` to `store`.
///
/// Reload failures are logged and leave the active rules in place.
pub fn spawn_reloader(
    store: Arc<RuleStore>,
    config_path: PathBuf,
) -> Result<thread::JoinHandle<()>, notify::Error> {
    let events = spawn_config_watcher(&config_path, DEBOUNCE)?;

    thread::Builder::new()
        .name("config-reloader".to_string())
        .spawn(move || {
            for event in events {
                match event {
                    ConfigEvent::Modified => {
                        info!("configuration file changed, reloading...");
                        match store.reload_from_path(&config_path) {
                            Ok(_) => info!(
                                "configuration reloaded successfully (generation {})",
                                store.generation()
                            ),
                            Err(e) => warn!("failed to reload config: {}", e),
                        }
                    }
                    ConfigEvent::Error(e) => warn!("config watcher error: {}", e),
                }
            }
        })
        .map_err(notify::Error::io)
}
