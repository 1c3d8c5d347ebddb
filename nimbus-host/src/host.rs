//! The public worker host
//!
//! [`WorkerHost`] is a cheap handle over shared state. Every entry point
//! takes the reload lock first, so dispatch always sees a fully initialised
//! worker and lifecycle calls never interleave.

use crate::error::{DispatchError, HostError};
use crate::orchestrator::{HostContext, Orchestrator, PluginInstances, ReloadEvent};
use crate::scope::{DispatchedResponse, GlobalScope, ScopeDispatch, LOOP_HEADER, MAX_LOOP_DEPTH};
use crate::watch::WatchCallback;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_plugin_api::{
    Compatibility, Fetcher, HeadersGuard, Options, PluginDescriptor, Request, Response,
};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, MappedMutexGuard, Mutex, MutexGuard};

/// Mutex that also counts watch callbacks queued behind it
pub(crate) struct ReloadMutex<T> {
    inner: Mutex<T>,
    waiting: AtomicUsize,
}

struct Queued<'a>(&'a AtomicUsize);

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> ReloadMutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            waiting: AtomicUsize::new(0),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().await
    }

    /// Locks, counting as queued until the lock is acquired
    pub(crate) async fn lock_queued(&self) -> MutexGuard<'_, T> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _queued = Queued(&self.waiting);
        self.inner.lock().await
    }

    /// Whether some `lock_queued` caller is still waiting
    pub(crate) fn has_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) > 0
    }
}

struct Shared {
    state: ReloadMutex<Orchestrator>,
    reload_tx: broadcast::Sender<ReloadEvent>,
}

/// A running worker: its plugins, global scope and dispatch surface
#[derive(Clone)]
pub struct WorkerHost {
    shared: Arc<Shared>,
}

impl WorkerHost {
    /// Builds the worker, resolving once the first init and reload finish.
    ///
    /// `descriptors` are reordered so the core plugin runs first and the
    /// bindings plugin last; the core plugin is added if missing.
    pub async fn new(
        descriptors: Vec<Arc<dyn PluginDescriptor>>,
        ctx: HostContext,
        options: Options,
    ) -> Result<Self, HostError> {
        let (reload_tx, _) = broadcast::channel(16);
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let callback = watch_callback(weak.clone());
            Shared {
                state: ReloadMutex::new(Orchestrator::new(
                    descriptors,
                    ctx,
                    options,
                    Some(callback),
                    reload_tx.clone(),
                )),
                reload_tx,
            }
        });
        let host = Self { shared };
        {
            let mut state = host.shared.state.lock().await;
            state.init().await?;
            state.reload().await?;
        }
        Ok(host)
    }

    /// Receives a [`ReloadEvent`] after every later reload
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.shared.reload_tx.subscribe()
    }

    /// Merges `options` over the current options, then reinitialises
    pub async fn set_options(&self, options: Options) -> Result<(), HostError> {
        let mut state = self.shared.state.lock().await;
        if state.is_disposed() {
            return Err(HostError::Disposed);
        }
        state.set_options(options);
        state.init().await?;
        state.reload().await
    }

    /// Reinitialises with the current options and rebuilds the scope
    pub async fn reload(&self) -> Result<(), HostError> {
        let mut state = self.shared.state.lock().await;
        state.init().await?;
        state.reload().await
    }

    /// Disposes every plugin and stops watching. The host is unusable after.
    pub async fn dispose(&self) -> Result<(), HostError> {
        self.shared.state.lock().await.dispose().await
    }

    /// Plugin instances, locked until the guard is dropped
    pub async fn plugins(&self) -> MappedMutexGuard<'_, PluginInstances> {
        let state = self.shared.state.lock().await;
        MutexGuard::map(state, |state| state.plugins_mut())
    }

    pub async fn plugin_names(&self) -> Vec<String> {
        self.shared.state.lock().await.plugins().names().to_vec()
    }

    /// The current global scope
    pub async fn global_scope(&self) -> Result<Arc<GlobalScope>, HostError> {
        let state = self.shared.state.lock().await;
        state.global_scope().ok_or(HostError::Disposed)
    }

    pub async fn compat(&self) -> Compatibility {
        self.shared.state.lock().await.compat().clone()
    }

    pub async fn is_watching(&self) -> bool {
        self.shared.state.lock().await.is_watching()
    }

    /// Paths currently registered with the watcher
    pub async fn watch_paths(&self) -> HashSet<PathBuf> {
        self.shared.state.lock().await.watch_paths().clone()
    }

    /// Dispatches a request into the worker's fetch listeners.
    ///
    /// The request's `mf-loop` header counts how often it already passed
    /// through a worker; requests nested too deeply are refused. With an
    /// upstream configured the URL is rewritten to the upstream origin.
    pub async fn dispatch_fetch(
        &self,
        request: Request,
    ) -> Result<DispatchedResponse, DispatchError> {
        let (scope, form_data_files) = {
            let state = self.shared.state.lock().await;
            let scope = state.global_scope().ok_or(DispatchError::Disposed)?;
            let form_data_files = state.compat().is_enabled("formdata_parser_supports_files");
            (scope, form_data_files)
        };

        let depth = request
            .header(LOOP_HEADER)
            .and_then(|depth| depth.trim().parse::<u32>().ok())
            .unwrap_or(0)
            + 1;
        if depth > MAX_LOOP_DEPTH {
            return Err(DispatchError::DepthLimit {
                limit: MAX_LOOP_DEPTH,
            });
        }

        let mut request = request;
        if let Some(upstream) = scope.upstream() {
            request.set_url(rewrite_to_upstream(request.url(), upstream));
        }
        let request = request
            .with_guard(HeadersGuard::Immutable)
            .with_form_data_files(form_data_files);

        scope.dispatch_fetch(request, depth).await
    }

    /// Dispatches a scheduled event, returning the wait-until results.
    ///
    /// `scheduled_time` defaults to now and `cron` to an empty string.
    pub async fn dispatch_scheduled(
        &self,
        scheduled_time: Option<DateTime<Utc>>,
        cron: Option<&str>,
    ) -> Result<Vec<Value>, DispatchError> {
        let scope = {
            let state = self.shared.state.lock().await;
            state.global_scope().ok_or(DispatchError::Disposed)?
        };
        scope
            .dispatch_scheduled(
                scheduled_time.unwrap_or_else(Utc::now),
                cron.unwrap_or_default().to_string(),
            )
            .await
    }

    /// Handles a change to a watched path.
    ///
    /// Reloads only if no other change is queued behind this one, so a burst
    /// of changes results in a single reload. Failures are logged.
    pub async fn handle_file_change(&self, path: &Path) {
        let mut state = self.shared.state.lock_queued().await;
        if state.is_disposed() {
            return;
        }
        let result = match state.rerun_for_path(path).await {
            Ok(()) if self.shared.state.has_waiting() => {
                tracing::trace!(path = %path.display(), "Reload deferred to queued change");
                Ok(())
            }
            Ok(()) => state.reload().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::error!(path = %path.display(), error = %e, "Failed to reload after change");
        }
    }
}

fn watch_callback(shared: Weak<Shared>) -> WatchCallback {
    Arc::new(move |path: PathBuf| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let host = WorkerHost { shared };
        tokio::spawn(async move { host.handle_file_change(&path).await });
    })
}

/// Keeps path and query, takes scheme, host and port from `upstream`
fn rewrite_to_upstream(url: &url::Url, upstream: &url::Url) -> url::Url {
    let mut rewritten = upstream.clone();
    rewritten.set_path(url.path());
    rewritten.set_query(url.query());
    rewritten
}

#[async_trait]
impl Fetcher for WorkerHost {
    async fn fetch(&self, request: Request) -> anyhow::Result<Response> {
        let response = self.dispatch_fetch(request).await?;
        Ok(response.into_response())
    }
}

impl fmt::Debug for WorkerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHost").finish_non_exhaustive()
    }
}
