//! Host lifecycle and dispatch errors

use crate::config::ConfigError;
use crate::scope::ScopeError;
use crate::watch::WatcherError;
use nimbus_plugin_api::{CompatibilityError, EventError, PluginError, RequestError};
use thiserror::Error;

/// Errors raised while initialising, reloading or disposing a worker
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{hook}({plugin}) failed: {source}")]
    Plugin {
        plugin: String,
        hook: &'static str,
        #[source]
        source: PluginError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),

    #[error(
        "No script defined, either include it explicitly, or set build.upload.main in your configuration"
    )]
    NoScript,

    #[error("Multiple plugins returned a script ({first} and {second}); a worker can only have one")]
    MultipleScripts { first: String, second: String },

    #[error("Script runner failed: {0:#}")]
    Runner(#[source] anyhow::Error),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error("Worker host has been disposed")]
    Disposed,
}

impl HostError {
    pub(crate) fn plugin(plugin: &str, hook: &'static str, source: PluginError) -> Self {
        Self::Plugin {
            plugin: plugin.to_string(),
            hook,
            source,
        }
    }

    /// Exit code of a failed build step, if that is what failed
    pub fn build_exit_code(&self) -> Option<i32> {
        match self {
            Self::Plugin { source, .. } => source.build_exit_code(),
            _ => None,
        }
    }
}

/// Errors raised while dispatching an event into the worker
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(
        "No fetch handler responded and no upstream to proxy to specified.\nHave you added a fetch event listener that responds with a Response?"
    )]
    NoHandler,

    #[error(
        "No fetch handler responded and no upstream to proxy to specified.\nMake sure you're calling event.respond_with() with a Response or a future resolving to one."
    )]
    NoResponse,

    #[error("Uncaught error in event handler: {0:#}")]
    Listener(#[source] anyhow::Error),

    #[error(transparent)]
    State(#[from] EventError),

    #[error("Upstream request failed: {0:#}")]
    Upstream(#[source] anyhow::Error),

    #[error("Subrequest depth limit exceeded: a worker may only proxy to itself {limit} times")]
    DepthLimit { limit: u32 },

    #[error("wait_until task failed: {0:#}")]
    WaitUntil(#[source] anyhow::Error),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error("Worker host has been disposed")]
    Disposed,
}

impl DispatchError {
    /// Maps a listener failure, surfacing event state violations as such
    pub(crate) fn from_listener(error: anyhow::Error) -> Self {
        match error.downcast::<EventError>() {
            Ok(state) => Self::State(state),
            Err(error) => Self::Listener(error),
        }
    }
}
