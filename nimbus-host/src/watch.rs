//! File watching for watch mode
//!
//! The host only needs watch/unwatch/dispose and a change callback, so any
//! [`Watcher`] can be plugged in through a [`WatcherFactory`]. The default
//! implementation, [`NotifyWatcher`], debounces `notify` events and reports
//! the registered path each event falls under.

use async_trait::async_trait;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Called with the registered path that changed
pub type WatchCallback = Arc<dyn Fn(PathBuf) + Send + Sync>;

/// Builds the watcher lazily, the first time watch mode needs one
pub type WatcherFactory =
    Arc<dyn Fn(WatchCallback) -> Result<Box<dyn Watcher>, WatcherError> + Send + Sync>;

/// A file watcher
#[async_trait]
pub trait Watcher: Send + Sync {
    async fn watch(&mut self, paths: &HashSet<PathBuf>) -> Result<(), WatcherError>;

    fn unwatch(&mut self, paths: &HashSet<PathBuf>);

    fn dispose(&mut self);
}

/// Paths to start and stop watching
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchDelta {
    pub added: HashSet<PathBuf>,
    pub removed: HashSet<PathBuf>,
}

impl WatchDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Computes the incremental change from `previous` to `next`
pub fn diff_watch_paths(previous: &HashSet<PathBuf>, next: &HashSet<PathBuf>) -> WatchDelta {
    WatchDelta {
        added: next.difference(previous).cloned().collect(),
        removed: previous.difference(next).cloned().collect(),
    }
}

/// Configuration for [`NotifyWatcher`]
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for file events
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
        }
    }
}

/// What `notify` actually watches for one registered path
#[derive(Debug, Clone, PartialEq, Eq)]
struct WatchTarget {
    path: PathBuf,
    mode: RecursiveMode,
}

impl WatchTarget {
    /// Missing files are watched through their directory, non-recursively,
    /// so their creation is seen
    fn for_path(path: &Path) -> Option<Self> {
        if path.exists() {
            let mode = if path.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            return Some(Self {
                path: path.to_path_buf(),
                mode,
            });
        }
        match path.parent() {
            Some(parent) if parent.exists() => Some(Self {
                path: parent.to_path_buf(),
                mode: RecursiveMode::NonRecursive,
            }),
            _ => None,
        }
    }
}

/// [`Watcher`] backed by the platform's native file events
pub struct NotifyWatcher {
    watcher: RecommendedWatcher,
    paths: Arc<RwLock<HashSet<PathBuf>>>,
    targets: HashMap<PathBuf, WatchTarget>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl NotifyWatcher {
    /// Creates the watcher and spawns its debounce loop. Must be called from
    /// within a tokio runtime.
    pub fn new(callback: WatchCallback, config: WatcherConfig) -> Result<Self, WatcherError> {
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let _ = event_tx.blocking_send(event);
                }
                Err(e) => tracing::warn!(error = %e, "File watcher error"),
            }
        })
        .map_err(WatcherError::Init)?;

        let paths: Arc<RwLock<HashSet<PathBuf>>> = Arc::default();
        let registered = paths.clone();
        let debounce = config.debounce;
        tokio::spawn(async move {
            let mut pending: Vec<PathBuf> = Vec::new();
            let mut debounce_timer: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("File watcher shutting down");
                        break;
                    }

                    Some(event) = event_rx.recv() => {
                        let registered = registered.read();
                        for path in &event.paths {
                            if let Some(path) = registered_path(&registered, path) {
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
                            callback(path);
                        }
                        debounce_timer = None;
                    }
                }
            }
        });

        Ok(Self {
            watcher,
            paths,
            targets: HashMap::new(),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Factory for [`HostContext`](crate::HostContext)
    pub fn factory(config: WatcherConfig) -> WatcherFactory {
        Arc::new(
            move |callback: WatchCallback| -> Result<Box<dyn Watcher>, WatcherError> {
                Ok(Box::new(NotifyWatcher::new(callback, config.clone())?))
            },
        )
    }

    /// Currently registered paths
    pub fn paths(&self) -> HashSet<PathBuf> {
        self.paths.read().clone()
    }

    /// Paths handed to `notify`, with their recursion
    pub fn targets(&self) -> HashMap<PathBuf, RecursiveMode> {
        let mut targets = HashMap::new();
        for target in self.targets.values() {
            let mode = targets.entry(target.path.clone()).or_insert(target.mode);
            if target.mode == RecursiveMode::Recursive {
                *mode = RecursiveMode::Recursive;
            }
        }
        targets
    }

    /// Whether another registered path already covers `target`
    fn is_covered(&self, target: &WatchTarget) -> bool {
        self.targets.values().any(|existing| {
            existing.path == target.path
                && (existing.mode == RecursiveMode::Recursive
                    || target.mode == RecursiveMode::NonRecursive)
        })
    }
}

#[async_trait]
impl Watcher for NotifyWatcher {
    async fn watch(&mut self, paths: &HashSet<PathBuf>) -> Result<(), WatcherError> {
        for path in paths {
            if self.targets.contains_key(path) {
                continue;
            }
            let Some(target) = WatchTarget::for_path(path) else {
                tracing::warn!(path = %path.display(), "Path does not exist, skipping");
                continue;
            };
            if !self.is_covered(&target) {
                self.watcher
                    .watch(&target.path, target.mode)
                    .map_err(|source| WatcherError::Watch {
                        path: path.clone(),
                        source,
                    })?;
            }
            tracing::trace!(path = %path.display(), target = %target.path.display(), "Watching");
            self.targets.insert(path.clone(), target);
            self.paths.write().insert(path.clone());
        }
        Ok(())
    }

    fn unwatch(&mut self, paths: &HashSet<PathBuf>) {
        for path in paths {
            self.paths.write().remove(path);
            let Some(target) = self.targets.remove(path) else {
                continue;
            };
            let remaining: Vec<RecursiveMode> = self
                .targets
                .values()
                .filter(|existing| existing.path == target.path)
                .map(|existing| existing.mode)
                .collect();
            if remaining.is_empty() {
                if let Err(e) = self.watcher.unwatch(&target.path) {
                    tracing::debug!(path = %target.path.display(), error = %e, "Failed to unwatch");
                }
            } else if target.mode == RecursiveMode::Recursive
                && !remaining.contains(&RecursiveMode::Recursive)
            {
                // Narrow back to what the remaining paths need
                let rewatch = self
                    .watcher
                    .unwatch(&target.path)
                    .and_then(|()| self.watcher.watch(&target.path, RecursiveMode::NonRecursive));
                if let Err(e) = rewatch {
                    tracing::debug!(
                        path = %target.path.display(),
                        error = %e,
                        "Failed to narrow watch"
                    );
                }
            }
        }
    }

    fn dispose(&mut self) {
        let paths: HashSet<PathBuf> = self.paths.read().clone();
        self.unwatch(&paths);
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.try_send(());
        }
    }
}

impl Drop for NotifyWatcher {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.try_send(());
        }
    }
}

impl fmt::Debug for NotifyWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyWatcher")
            .field("paths", &self.paths.read().len())
            .finish()
    }
}

/// The registered path an event path falls under, if any
fn registered_path(registered: &HashSet<PathBuf>, path: &Path) -> Option<PathBuf> {
    if registered.contains(path) {
        return Some(path.to_path_buf());
    }
    path.ancestors()
        .skip(1)
        .find(|ancestor| registered.contains(*ancestor))
        .map(Path::to_path_buf)
}

/// Errors that can occur during watching
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to initialize watcher: {0}")]
    Init(#[source] notify::Error),

    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}
