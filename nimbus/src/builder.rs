//! Host construction with default collaborators

use nimbus_host::{
    builtin_descriptors, HostContext, HostError, NotifyWatcher, RejectionRegistry, ScriptRunner,
    WatcherConfig, WatcherFactory, WorkerHost,
};
use nimbus_plugin_api::{Fetcher, Options, PluginDescriptor, ServiceRegistry, StorageFactory};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Builds a [`WorkerHost`].
///
/// Starts from the built-in `core`, `build` and `bindings` plugins, an
/// in-memory store, the HTTP fetcher and a `notify` watcher. Plugins added
/// with [`plugin`](Self::plugin) replace a built-in of the same name.
///
/// ```ignore
/// let host = NimbusBuilder::new()
///     .option("script", "addEventListener('fetch', ...)")
///     .option("watch", true)
///     .with_script_runner(runner)
///     .build()
///     .await?;
/// ```
pub struct NimbusBuilder {
    plugins: Vec<Arc<dyn PluginDescriptor>>,
    builtins: bool,
    options: Options,
    ctx: HostContext,
}

impl NimbusBuilder {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            builtins: true,
            options: Options::new(),
            ctx: HostContext::default()
                .with_watcher_factory(NotifyWatcher::factory(WatcherConfig::default())),
        }
    }

    /// Adds a plugin
    pub fn plugin(mut self, descriptor: Arc<dyn PluginDescriptor>) -> Self {
        self.plugins.push(descriptor);
        self
    }

    /// Leaves out `build` and `bindings`. `core` is always present.
    pub fn without_builtins(mut self) -> Self {
        self.builtins = false;
        self
    }

    /// Sets a single option
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Sets every option in `options`, keeping the ones already set
    pub fn options(mut self, options: Options) -> Self {
        self.options.extend(options);
        self
    }

    pub fn with_script_runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.ctx = self.ctx.with_script_runner(runner);
        self
    }

    /// Fail when no plugin provides a script
    pub fn with_script_required(mut self, required: bool) -> Self {
        self.ctx = self.ctx.with_script_required(required);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.ctx = self.ctx.with_fetcher(fetcher);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageFactory>) -> Self {
        self.ctx = self.ctx.with_storage(storage);
        self
    }

    /// Services that service bindings resolve against
    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.ctx = self.ctx.with_services(services);
        self
    }

    pub fn with_rejections(mut self, rejections: RejectionRegistry) -> Self {
        self.ctx = self.ctx.with_rejections(rejections);
        self
    }

    pub fn with_watcher_factory(mut self, factory: WatcherFactory) -> Self {
        self.ctx = self.ctx.with_watcher_factory(factory);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.ctx = self.ctx.with_cwd(cwd);
        self
    }

    /// Subscriber settings for the `debug` and `verbose` options
    #[cfg(feature = "tracing")]
    pub fn tracing_config(&self) -> crate::TracingConfig {
        let flag = |key: &str| self.options.get(key).and_then(Value::as_bool).unwrap_or(false);
        crate::TracingConfig::from_flags(flag("debug"), flag("verbose"))
    }

    /// Plugin descriptors in the order they were added, built-ins included
    pub fn descriptors(&self) -> Vec<Arc<dyn PluginDescriptor>> {
        let mut descriptors = Vec::new();
        for builtin in builtin_descriptors() {
            let replaced = self
                .plugins
                .iter()
                .any(|plugin| plugin.name() == builtin.name());
            let core = builtin.name() == "core";
            if !replaced && (self.builtins || core) {
                descriptors.push(builtin);
            }
        }
        descriptors.extend(self.plugins.iter().cloned());
        descriptors
    }

    /// Initialises the host and runs its first reload
    pub async fn build(self) -> Result<WorkerHost, HostError> {
        let descriptors = self.descriptors();
        WorkerHost::new(descriptors, self.ctx, self.options).await
    }
}

impl Default for NimbusBuilder {
    fn default() -> Self {
        Self::new()
    }
}
