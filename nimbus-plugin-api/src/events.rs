//! Fetch and scheduled events delivered to worker scripts
//!
//! A [`FetchEvent`] carries a single-assignment response slot. Listeners run
//! synchronously; `respond_with` stores a future that the dispatcher awaits
//! once every listener has returned. Calling it twice, or after the
//! dispatcher has marked the event as sent, is an [`EventError`].
//!
//! Events are created in pairs with a [`FetchDispatch`] or
//! [`ScheduledDispatch`]. Only the dispatcher holds that half, so listeners
//! cannot take each other's responses or settle wait-until tasks early.

use crate::http::{Request, Response};
use crate::values::Context;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Future resolving to a worker's response
pub type ResponseFuture = BoxFuture<'static, anyhow::Result<Response>>;

/// Background task registered through `wait_until`
pub type WaitUntilTask = BoxFuture<'static, anyhow::Result<Value>>;

/// Classic-style fetch listener
pub type FetchListener = Arc<dyn Fn(&FetchEvent) -> anyhow::Result<()> + Send + Sync>;

/// Classic-style scheduled listener
pub type ScheduledListener = Arc<dyn Fn(&ScheduledEvent) -> anyhow::Result<()> + Send + Sync>;

/// `fetch(request, env, ctx)` exported by a module worker
pub type ModuleFetchHandler =
    Arc<dyn Fn(Request, Arc<Context>, ExecutionContext) -> ResponseFuture + Send + Sync>;

/// `scheduled(controller, env, ctx)` exported by a module worker
pub type ModuleScheduledHandler =
    Arc<dyn Fn(ScheduledController, Arc<Context>, ExecutionContext) -> WaitUntilTask + Send + Sync>;

/// State violations when responding to an event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("FetchEvent.respondWith() has already been called; it can only be called once.")]
    AlreadyResponded,

    #[error(
        "Too late to call FetchEvent.respondWith(). It must be called synchronously in the event handler."
    )]
    TooLate,
}

/// Accumulates wait-until tasks for one event
#[derive(Clone, Default)]
pub struct WaitUntil {
    tasks: Arc<Mutex<Vec<WaitUntilTask>>>,
}

impl WaitUntil {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.tasks.lock().push(Box::pin(task));
    }

    /// Number of tasks not yet taken by [`WaitUntil::settle`]
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Awaits every registered task, including tasks registered while earlier
    /// ones were still running, until no new tasks appear.
    ///
    /// Results keep registration order. The first failure is returned after
    /// its whole batch has settled.
    pub async fn settle(&self) -> anyhow::Result<Vec<Value>> {
        let mut results = Vec::new();
        loop {
            let batch = std::mem::take(&mut *self.tasks.lock());
            if batch.is_empty() {
                return Ok(results);
            }
            for result in futures::future::join_all(batch).await {
                results.push(result?);
            }
        }
    }
}

impl fmt::Debug for WaitUntil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitUntil")
            .field("pending", &self.pending())
            .finish()
    }
}

#[derive(Default)]
struct FetchState {
    response: Option<ResponseFuture>,
    responded: bool,
    sent: bool,
    pass_through: bool,
    propagation_stopped: bool,
}

struct FetchEventInner {
    request: Request,
    state: Mutex<FetchState>,
    wait_until: WaitUntil,
}

/// An incoming HTTP request delivered to fetch listeners
#[derive(Clone)]
pub struct FetchEvent {
    inner: Arc<FetchEventInner>,
}

impl FetchEvent {
    /// Creates an event and the dispatcher-side handle controlling it
    pub fn dispatch(request: Request) -> (Self, FetchDispatch) {
        let inner = Arc::new(FetchEventInner {
            request,
            state: Mutex::new(FetchState::default()),
            wait_until: WaitUntil::new(),
        });
        (
            Self {
                inner: inner.clone(),
            },
            FetchDispatch { inner },
        )
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Sets the response. Stops propagation to later listeners.
    pub fn respond_with<F>(&self, response: F) -> Result<(), EventError>
    where
        F: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.responded {
            return Err(EventError::AlreadyResponded);
        }
        if state.sent {
            return Err(EventError::TooLate);
        }
        state.responded = true;
        state.propagation_stopped = true;
        state.response = Some(Box::pin(response));
        Ok(())
    }

    /// Responds with an already-built response
    pub fn respond(&self, response: Response) -> Result<(), EventError> {
        self.respond_with(async move { Ok(response) })
    }

    /// If a listener later fails, fall back to the upstream instead of erroring
    pub fn pass_through_on_exception(&self) {
        self.inner.state.lock().pass_through = true;
    }

    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.inner.wait_until.push(task);
    }

    pub fn stop_immediate_propagation(&self) {
        self.inner.state.lock().propagation_stopped = true;
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.inner.state.lock().propagation_stopped
    }

    pub fn is_pass_through(&self) -> bool {
        self.inner.state.lock().pass_through
    }
}

impl fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FetchEvent")
            .field("url", &self.inner.request.url().as_str())
            .field("responded", &state.responded)
            .field("sent", &state.sent)
            .field("pass_through", &state.pass_through)
            .finish()
    }
}

/// A cron trigger delivered to scheduled listeners
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    scheduled_time: DateTime<Utc>,
    cron: String,
    wait_until: WaitUntil,
}

impl ScheduledEvent {
    /// Creates an event and the dispatcher-side handle onto its tasks
    pub fn dispatch(
        scheduled_time: DateTime<Utc>,
        cron: impl Into<String>,
    ) -> (Self, ScheduledDispatch) {
        let wait_until = WaitUntil::new();
        let event = Self {
            scheduled_time,
            cron: cron.into(),
            wait_until: wait_until.clone(),
        };
        (event, ScheduledDispatch { wait_until })
    }

    pub fn scheduled_time(&self) -> DateTime<Utc> {
        self.scheduled_time
    }

    pub fn cron(&self) -> &str {
        &self.cron
    }

    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.wait_until.push(task);
    }
}

/// Dispatcher half of a [`FetchEvent`].
///
/// Not `Clone`, and only [`FetchEvent::dispatch`] hands one out, so code
/// holding the event cannot reach these controls:
///
/// ```compile_fail
/// use nimbus_plugin_api::{FetchEvent, Request};
///
/// let (event, _dispatch) = FetchEvent::dispatch(Request::get("http://localhost/").unwrap());
/// event.take_response();
/// ```
pub struct FetchDispatch {
    inner: Arc<FetchEventInner>,
}

impl FetchDispatch {
    /// Marks listeners as finished; later `respond_with` calls fail
    pub fn mark_sent(&self) {
        self.inner.state.lock().sent = true;
    }

    /// Takes the response future set by a listener
    pub fn take_response(&self) -> Option<ResponseFuture> {
        self.inner.state.lock().response.take()
    }

    /// Handle onto the event's wait-until tasks
    pub fn wait_until(&self) -> WaitUntil {
        self.inner.wait_until.clone()
    }
}

impl fmt::Debug for FetchDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchDispatch")
            .field("url", &self.inner.request.url().as_str())
            .finish()
    }
}

/// Dispatcher half of a [`ScheduledEvent`]
#[derive(Debug)]
pub struct ScheduledDispatch {
    wait_until: WaitUntil,
}

impl ScheduledDispatch {
    /// Handle onto the event's wait-until tasks
    pub fn wait_until(&self) -> WaitUntil {
        self.wait_until.clone()
    }
}

/// First argument of a module worker's `scheduled` handler
#[derive(Debug, Clone)]
pub struct ScheduledController {
    pub scheduled_time: DateTime<Utc>,
    pub cron: String,
}

/// Third argument of module worker handlers
#[derive(Clone)]
pub struct ExecutionContext {
    wait_until: WaitUntil,
    fetch_event: Option<FetchEvent>,
}

impl ExecutionContext {
    pub fn for_fetch(event: &FetchEvent) -> Self {
        Self {
            wait_until: event.inner.wait_until.clone(),
            fetch_event: Some(event.clone()),
        }
    }

    pub fn for_scheduled(event: &ScheduledEvent) -> Self {
        Self {
            wait_until: event.wait_until.clone(),
            fetch_event: None,
        }
    }

    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.wait_until.push(task);
    }

    /// No-op outside fetch handlers
    pub fn pass_through_on_exception(&self) {
        if let Some(event) = &self.fetch_event {
            event.pass_through_on_exception();
        }
    }
}

/// Handlers exported as a module worker's default export
#[derive(Clone, Default)]
pub struct ExportedHandler {
    pub fetch: Option<ModuleFetchHandler>,
    pub scheduled: Option<ModuleScheduledHandler>,
}

impl fmt::Debug for ExportedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedHandler")
            .field("fetch", &self.fetch.is_some())
            .field("scheduled", &self.scheduled.is_some())
            .finish()
    }
}

/// Exports of a module worker
#[derive(Debug, Clone, Default)]
pub struct ModuleExports {
    pub default: Option<ExportedHandler>,
    pub named: Context,
}
