//! nimbus-host: Plugin orchestration and event dispatch for nimbus workers
//!
//! This crate turns a set of plugin descriptors and an options bag into a
//! running worker. It merges options with the declarative config file, runs
//! the plugin lifecycle, builds the worker's global scope, hands the script
//! to a [`ScriptRunner`], watches files in watch mode and dispatches fetch
//! and scheduled events.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod host;
pub mod orchestrator;
pub mod plugins;
pub mod rejection;
pub mod runner;
pub mod scope;
pub mod watch;

pub use config::{ConfigError, DEFAULT_CONFIG_FILE};
pub use error::{DispatchError, HostError};
pub use fetcher::HttpFetcher;
pub use host::WorkerHost;
pub use orchestrator::{order_descriptors, HostContext, PluginInstances, ReloadEvent};
pub use plugins::{
    builtin_descriptors, BindingsPlugin, BuildPlugin, CorePlugin, ServiceBinding,
};
pub use rejection::{ListenerId, RejectionListener, RejectionRegistry};
pub use runner::{
    ModuleRule, ModuleRuleType, NativeRunner, ProcessedModuleRule, ScriptRunner,
    ScriptRunnerResult,
};
pub use scope::{
    DispatchedResponse, GlobalScope, PendingWaitUntil, ScopeError, LOOP_HEADER, MAX_LOOP_DEPTH,
};
pub use watch::{
    NotifyWatcher, WatchCallback, Watcher, WatcherConfig, WatcherError, WatcherFactory,
};
