//! # nimbus: a local edge worker runtime
//!
//! Runs a worker script under a set of plugins, reloading it as its
//! configuration and sources change, and dispatches fetch and scheduled
//! events into it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nimbus::{init_subscriber_with_config, NativeRunner, NimbusBuilder, Request, Response};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runner = NativeRunner::new(|scope, _script| {
//!         scope.add_fetch_listener(Arc::new(|event: &nimbus::FetchEvent| {
//!             event.respond(Response::new("Hello from nimbus"))?;
//!             Ok(())
//!         }))?;
//!         Ok(None)
//!     });
//!
//!     let builder = NimbusBuilder::new()
//!         .option("script", "")
//!         .option("config_path", true)
//!         .option("watch", true)
//!         .with_script_runner(Arc::new(runner));
//!     init_subscriber_with_config(builder.tracing_config());
//!
//!     let host = builder.build().await?;
//!     let response = host.dispatch_fetch(Request::get("http://localhost/")?).await?;
//!     println!("{}", response.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Plugins
//!
//! A plugin is a [`Plugin`] implementation plus a typed options struct
//! deriving [`PluginOptions`]. Options are merged from the API bag and the
//! declarative `nimbus.toml`, and a plugin is only rebuilt when its own
//! merged options change.

pub mod builder;
pub mod tracing_support;

pub use builder::NimbusBuilder;

pub use nimbus_host::{
    BindingsPlugin, BuildPlugin, CorePlugin, DispatchError, DispatchedResponse, GlobalScope,
    HostContext, HostError, HttpFetcher, ModuleRule, ModuleRuleType, NativeRunner,
    NotifyWatcher, PendingWaitUntil, RejectionRegistry, ReloadEvent, ScriptRunner,
    ScriptRunnerResult, ServiceBinding, Watcher, WatcherConfig, WorkerHost, DEFAULT_CONFIG_FILE,
    LOOP_HEADER, MAX_LOOP_DEPTH,
};
pub use nimbus_plugin_api::{
    descriptor, BeforeSetupResult, Compatibility, ConfigurablePlugin, Context, DeclarativeConfig,
    ExecutionContext, ExportedHandler, FetchEvent, Fetcher, ModuleExports, OptionKind,
    OptionMeta, OptionSchema, Options, Plugin, PluginContext, PluginDescriptor, PluginError,
    PluginOptions, PluginRole, PluginStorageFactory, Request, Response, ScheduledEvent,
    ScopeValue, ScriptBlueprint, ServiceRegistry, SetupResult,
};

// Re-export tracing itself (required for #[instrument] macro)
#[cfg(feature = "tracing")]
pub use tracing_support::tracing;

#[cfg(feature = "tracing")]
pub use tracing_support::{
    debug, error, info, init_subscriber, init_subscriber_with_config, instrument, trace, warn,
    TracingConfig, TracingFormat,
};
