//! The worker's global scope and event dispatch
//!
//! A [`GlobalScope`] is built fresh on every reload from the merged globals
//! and bindings. Worker code registers listeners through its public methods;
//! the host dispatches events through the crate-private [`ScopeDispatch`]
//! interface, which worker code never sees.

use crate::error::DispatchError;
use crate::rejection::{ListenerId, RejectionListener, RejectionRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue, HOST};
use nimbus_plugin_api::{
    Context, ExecutionContext, FetchEvent, FetchListener, Fetcher,
    HeadersGuard, ModuleFetchHandler, ModuleScheduledHandler, Request, Response,
    ScheduledController, ScheduledEvent, ScheduledListener, ScopeValue, WaitUntil,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use url::Url;

/// Loop-detection header carrying a request's proxy depth
pub const LOOP_HEADER: &str = "mf-loop";

/// Deepest a request may proxy back into a worker
pub const MAX_LOOP_DEPTH: u32 = 16;

/// Misuse of the global scope by worker code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error(
        "{0} is not defined.\nAttempted to access binding using global in modules.\nYou must use the `env` parameter passed to exported handlers instead."
    )]
    BindingInModules(String),

    #[error(
        "Global event listeners cannot be used in modules. Instead, event handlers should be declared as exports on the root module."
    )]
    ListenerInModules,
}

/// Outcome of a response's wait-until tasks.
///
/// A failure nobody awaits through [`PendingWaitUntil::wait`], because the
/// handle was dropped first, is reported as an unhandled rejection.
pub struct PendingWaitUntil {
    receiver: Option<oneshot::Receiver<anyhow::Result<Vec<Value>>>>,
    rejections: RejectionRegistry,
}

impl PendingWaitUntil {
    fn spawn(wait_until: WaitUntil, rejections: RejectionRegistry) -> Self {
        let (tx, rx) = oneshot::channel();
        let reporter = rejections.clone();
        tokio::spawn(async move {
            let result = wait_until.settle().await;
            if let Err(Err(error)) = tx.send(result) {
                report_rejection(&reporter, &error);
            }
        });
        Self {
            receiver: Some(rx),
            rejections,
        }
    }

    /// Resolves once every wait-until task has settled
    pub async fn wait(mut self) -> anyhow::Result<Vec<Value>> {
        match self.receiver.take() {
            Some(receiver) => receiver.await?,
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for PendingWaitUntil {
    fn drop(&mut self) {
        // Tasks that already failed; later failures are reported by the task
        if let Some(mut receiver) = self.receiver.take() {
            if let Ok(Err(error)) = receiver.try_recv() {
                report_rejection(&self.rejections, &error);
            }
        }
    }
}

impl fmt::Debug for PendingWaitUntil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWaitUntil")
            .field("awaited", &self.receiver.is_none())
            .finish()
    }
}

fn report_rejection(rejections: &RejectionRegistry, error: &anyhow::Error) {
    if !rejections.report(error) {
        tracing::warn!(error = %format!("{error:#}"), "Unhandled wait_until failure");
    }
}

/// A worker's response plus its still-running wait-until tasks
#[derive(Debug)]
pub struct DispatchedResponse {
    response: Response,
    wait_until: PendingWaitUntil,
}

impl DispatchedResponse {
    fn new(response: Response, wait_until: WaitUntil, rejections: RejectionRegistry) -> Self {
        Self {
            response,
            wait_until: PendingWaitUntil::spawn(wait_until, rejections),
        }
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Resolves once every wait-until task has settled
    pub async fn wait_until(self) -> anyhow::Result<Vec<Value>> {
        self.wait_until.wait().await
    }

    /// Splits off the response; the tasks keep running in the background
    pub fn into_parts(self) -> (Response, PendingWaitUntil) {
        (self.response, self.wait_until)
    }

    /// Drops the wait-until handle, so task failures become unhandled
    /// rejections
    pub fn into_response(self) -> Response {
        self.response
    }
}

impl Deref for DispatchedResponse {
    type Target = Response;

    fn deref(&self) -> &Response {
        &self.response
    }
}

/// Sandbox namespace for one worker instance
pub struct GlobalScope {
    globals: Context,
    bindings: Arc<Context>,
    modules: bool,
    upstream: Option<Url>,
    fetcher: Arc<dyn Fetcher>,
    fetch_listeners: RwLock<Vec<FetchListener>>,
    scheduled_listeners: RwLock<Vec<ScheduledListener>>,
    rejections: RejectionRegistry,
    rejection_listeners: Mutex<Vec<ListenerId>>,
}

impl GlobalScope {
    pub fn new(
        globals: Context,
        bindings: Arc<Context>,
        modules: bool,
        fetcher: Arc<dyn Fetcher>,
        rejections: RejectionRegistry,
    ) -> Self {
        Self {
            globals,
            bindings,
            modules,
            upstream: None,
            fetcher,
            fetch_listeners: RwLock::new(Vec::new()),
            scheduled_listeners: RwLock::new(Vec::new()),
            rejections,
            rejection_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Origin to proxy unanswered requests to
    pub fn with_upstream(mut self, upstream: Option<Url>) -> Self {
        self.upstream = upstream;
        self
    }

    /// Looks up a name the way worker code would.
    ///
    /// In classic mode bindings shadow globals. In modules mode bindings are
    /// not globals at all, and reading one is an error pointing at `env`.
    pub fn get(&self, name: &str) -> Result<Option<ScopeValue>, ScopeError> {
        if self.modules {
            if let Some(value) = self.globals.get(name) {
                return Ok(Some(value.clone()));
            }
            if self.bindings.contains_key(name) {
                return Err(ScopeError::BindingInModules(name.to_string()));
            }
            return Ok(None);
        }
        Ok(self
            .bindings
            .get(name)
            .or_else(|| self.globals.get(name))
            .cloned())
    }

    /// Every name visible as a global
    pub fn context(&self) -> Context {
        let mut context = self.globals.clone();
        if !self.modules {
            context.extend(
                self.bindings
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone())),
            );
        }
        context
    }

    pub fn globals(&self) -> &Context {
        &self.globals
    }

    /// Bindings, passed as `env` to module handlers
    pub fn bindings(&self) -> &Arc<Context> {
        &self.bindings
    }

    pub fn is_modules(&self) -> bool {
        self.modules
    }

    pub fn upstream(&self) -> Option<&Url> {
        self.upstream.as_ref()
    }

    /// Subrequest from worker code
    pub async fn fetch(&self, request: Request) -> anyhow::Result<Response> {
        self.fetcher.fetch(request).await
    }

    /// Classic-style `addEventListener("fetch", ...)`
    pub fn add_fetch_listener(&self, listener: FetchListener) -> Result<(), ScopeError> {
        if self.modules {
            return Err(ScopeError::ListenerInModules);
        }
        self.fetch_listeners.write().push(listener);
        Ok(())
    }

    /// Classic-style `addEventListener("scheduled", ...)`
    pub fn add_scheduled_listener(&self, listener: ScheduledListener) -> Result<(), ScopeError> {
        if self.modules {
            return Err(ScopeError::ListenerInModules);
        }
        self.scheduled_listeners.write().push(listener);
        Ok(())
    }

    pub fn fetch_listener_count(&self) -> usize {
        self.fetch_listeners.read().len()
    }

    pub fn scheduled_listener_count(&self) -> usize {
        self.scheduled_listeners.read().len()
    }

    /// Listens for unhandled rejections until this scope is disposed
    pub fn add_unhandled_rejection_listener(&self, listener: RejectionListener) -> ListenerId {
        let id = self.rejections.add(listener);
        self.rejection_listeners.lock().push(id);
        id
    }

    pub fn remove_unhandled_rejection_listener(&self, id: ListenerId) -> bool {
        self.rejection_listeners.lock().retain(|existing| *existing != id);
        self.rejections.remove(id)
    }

    /// Reports a failure nothing awaited, e.g. from a detached task
    pub fn report_unhandled_rejection(&self, error: anyhow::Error) {
        if !self.rejections.report(&error) {
            tracing::error!(error = %format!("{error:#}"), "Unhandled rejection");
        }
    }
}

impl fmt::Debug for GlobalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalScope")
            .field("globals", &self.globals.keys().collect::<Vec<_>>())
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .field("modules", &self.modules)
            .field("upstream", &self.upstream.as_ref().map(Url::as_str))
            .field("fetch_listeners", &self.fetch_listener_count())
            .field("scheduled_listeners", &self.scheduled_listener_count())
            .finish()
    }
}

/// Host-side view of a [`GlobalScope`]
#[async_trait]
pub(crate) trait ScopeDispatch {
    /// Registers a module worker's exported `fetch`
    fn add_module_fetch_listener(&self, handler: ModuleFetchHandler);

    /// Registers a module worker's exported `scheduled`
    fn add_module_scheduled_listener(&self, handler: ModuleScheduledHandler);

    async fn dispatch_fetch(
        &self,
        request: Request,
        depth: u32,
    ) -> Result<DispatchedResponse, DispatchError>;

    async fn dispatch_scheduled(
        &self,
        scheduled_time: DateTime<Utc>,
        cron: String,
    ) -> Result<Vec<Value>, DispatchError>;

    /// Drops its rejection listeners. Dispatches already holding the scope
    /// still reach its event listeners.
    fn release(&self);

    /// Detaches every listener; the scope is unusable afterwards
    fn dispose(&self);
}

#[async_trait]
impl ScopeDispatch for GlobalScope {
    fn add_module_fetch_listener(&self, handler: ModuleFetchHandler) {
        let env = self.bindings.clone();
        let listener: FetchListener = Arc::new(move |event: &FetchEvent| -> anyhow::Result<()> {
            let ctx = ExecutionContext::for_fetch(event);
            let response = handler(event.request().clone(), env.clone(), ctx);
            event.respond_with(response)?;
            Ok(())
        });
        self.fetch_listeners.write().push(listener);
    }

    fn add_module_scheduled_listener(&self, handler: ModuleScheduledHandler) {
        let env = self.bindings.clone();
        let listener: ScheduledListener = Arc::new(move |event: &ScheduledEvent| -> anyhow::Result<()> {
            let controller = ScheduledController {
                scheduled_time: event.scheduled_time(),
                cron: event.cron().to_string(),
            };
            let ctx = ExecutionContext::for_scheduled(event);
            event.wait_until(handler(controller, env.clone(), ctx));
            Ok(())
        });
        self.scheduled_listeners.write().push(listener);
    }

    async fn dispatch_fetch(
        &self,
        request: Request,
        depth: u32,
    ) -> Result<DispatchedResponse, DispatchError> {
        // Keep the original for the upstream fallback
        let original = self.upstream.is_some().then(|| request.clone());
        let (event, dispatch) = FetchEvent::dispatch(request);
        let wait_until = dispatch.wait_until();

        let listeners = self.fetch_listeners.read().clone();
        let mut outcome = Ok(());
        for listener in &listeners {
            if let Err(error) = listener(&event) {
                outcome = Err(error);
                break;
            }
            if event.is_propagation_stopped() {
                break;
            }
        }
        dispatch.mark_sent();

        let outcome = match outcome {
            Ok(()) => match dispatch.take_response() {
                Some(response) => response.await.map(Some),
                None => Ok(None),
            },
            Err(error) => Err(error),
        };
        match outcome {
            Ok(Some(response)) => {
                let rejections = self.rejections.clone();
                return Ok(DispatchedResponse::new(response, wait_until, rejections));
            }
            Ok(None) => {}
            Err(error) if event.is_pass_through() => {
                tracing::warn!(
                    error = %format!("{error:#}"),
                    "Fetch handler failed, passing through"
                );
            }
            Err(error) => return Err(DispatchError::from_listener(error)),
        }

        let Some(request) = original else {
            return Err(if listeners.is_empty() {
                DispatchError::NoHandler
            } else {
                DispatchError::NoResponse
            });
        };

        let mut request = request.with_guard(HeadersGuard::Mutable);
        let headers = request.headers_mut()?;
        headers.remove(HOST);
        headers.insert(HeaderName::from_static(LOOP_HEADER), HeaderValue::from(depth));

        tracing::debug!(url = %request.url(), depth, "Proxying to upstream");
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(DispatchError::Upstream)?;
        Ok(DispatchedResponse::new(
            response,
            wait_until,
            self.rejections.clone(),
        ))
    }

    async fn dispatch_scheduled(
        &self,
        scheduled_time: DateTime<Utc>,
        cron: String,
    ) -> Result<Vec<Value>, DispatchError> {
        let (event, dispatch) = ScheduledEvent::dispatch(scheduled_time, cron);
        let listeners = self.scheduled_listeners.read().clone();
        for listener in &listeners {
            listener(&event).map_err(DispatchError::from_listener)?;
        }
        dispatch
            .wait_until()
            .settle()
            .await
            .map_err(DispatchError::WaitUntil)
    }

    fn release(&self) {
        for id in self.rejection_listeners.lock().drain(..) {
            self.rejections.remove(id);
        }
    }

    fn dispose(&self) {
        self.release();
        self.fetch_listeners.write().clear();
        self.scheduled_listeners.write().clear();
    }
}
