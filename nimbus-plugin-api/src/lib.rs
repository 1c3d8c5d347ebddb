//! nimbus-plugin-api: Plugin contract for the nimbus worker runtime
//!
//! This crate defines everything a plugin and a worker script see: typed
//! options with a static schema, the lifecycle hooks, storage, and the
//! request/event types dispatched into the worker's global scope.

pub mod compat;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod options;
pub mod plugin;
pub mod storage;
pub mod values;

pub use compat::{Compatibility, CompatibilityError};
pub use config::DeclarativeConfig;
pub use error::PluginError;
pub use events::{
    EventError, ExecutionContext, ExportedHandler, FetchDispatch, FetchEvent, FetchListener,
    ModuleExports, ModuleFetchHandler, ModuleScheduledHandler, ResponseFuture, ScheduledController,
    ScheduledDispatch, ScheduledEvent, ScheduledListener, WaitUntil, WaitUntilTask,
};
pub use http::{Fetcher, HeadersGuard, Request, RequestError, Response, ServiceRegistry};
pub use options::{
    ConfigExtractor, OptionKind, OptionMeta, OptionSchema, Options, PerPluginOptions,
    PluginOptions,
};
pub use plugin::{
    descriptor, BeforeSetupResult, ConfigurablePlugin, Plugin, PluginContext, PluginDescriptor,
    PluginRole, PluginType, ScriptBlueprint, SetupResult,
};
pub use storage::{
    MemoryStorageFactory, PluginStorageFactory, Storage, StorageError, StorageFactory,
};
pub use values::{Context, ScopeValue};

/// Derives [`OptionSchema`] for a typed options struct
pub use nimbus_macros::PluginOptions;
